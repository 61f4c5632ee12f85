//! The dispatcher: queue flush, ordered handler invocation, completion
//! accounting.
use crate::*;

impl Manager {
    /// Flushes the queue: drains a snapshot and dispatches every event on
    /// it. Events fired while flushing land in the fresh queue and are
    /// dispatched on the next flush.
    pub fn flush(&mut self) {
        let mark = self.executing_thread.is_none();
        if mark {
            self.executing_thread = Some(std::thread::current().id());
        }

        let drained: Vec<Queued> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for (event, channels) in drained {
            self.dispatch(event, channels);
        }

        if mark {
            self.executing_thread = None;
        }
    }

    /// Invokes every resolved handler of one event, in `(priority, filter)`
    /// order, collecting values, faults and suspensions.
    pub(crate) fn dispatch(&mut self, event: Arc<Event>, channels: Vec<Channel>) {
        if !event.is_silent() {
            debug!("DISPATCH {:?} ON {:?}", event, channels);
        }
        self.currently_handling = Some(event.clone());

        if event.wants_complete() {
            let mut state = event.state();
            if state.cause.is_none() {
                // self-rooted: the event is its own completion root
                state.cause = Some(event.clone());
            }
            state.effects = 1;
        }

        let handlers = self.resolve(&event, &channels);

        let mut error: Option<Fault> = None;
        for entry in handlers.iter() {
            event.state().handler = Some(entry.id);

            let outcome = {
                let mut ctx = Ctx::new(self, entry.owner, entry.owner_channel.clone());
                let mut func = entry.func.lock();
                (*func)(&mut ctx, &event)
            };

            // "truthy" for the filter short-circuit: a value other than a
            // literal false, a suspension, or a fault
            let mut truthy = false;
            match outcome {
                Ok(Outcome::Pass) => {}
                Ok(Outcome::Value(value)) => {
                    truthy = value.downcast_ref::<bool>() != Some(&false);
                    if let Some(slot) = event.value() {
                        slot.set(value);
                    }
                }
                Ok(Outcome::Suspend(flow)) => {
                    truthy = true;
                    {
                        let mut state = event.state();
                        state.waiting_handlers += 1;
                    }
                    if let Some(slot) = event.value() {
                        slot.set_promise();
                    }
                    self.tasks.push(TaskRecord {
                        event: event.clone(),
                        flow,
                        parent: None,
                    });
                }
                Err(boxed) => {
                    truthy = true;
                    let fault = Fault::capture(boxed, Some(entry.id));
                    warn!("FAULT IN {} FOR {:?}: {}", entry.id, event, fault.message());

                    if let Some(slot) = event.value() {
                        slot.set(Arc::new(fault.clone()));
                        slot.poison();
                    }
                    if event.wants_failure() {
                        let failure = Event::failure_notice(&event, fault.clone());
                        let fired_on = event.channels();
                        self.fire_to(failure, &fired_on);
                    }
                    self.fire(Event::error_notice(fault.clone()));
                    error = Some(fault);
                }
            }

            if truthy && entry.filter {
                break;
            }
        }

        self.currently_handling = None;
        self.event_done(&event, error.as_ref());
    }

    /// Bookkeeping once an event's handler list is exhausted: `done` and
    /// `success` notices, then the walk up the cause chain firing `complete`
    /// exactly once per opted-in event.
    pub(crate) fn event_done(&mut self, event: &Arc<Event>, error: Option<&Fault>) {
        {
            let state = event.state();
            if state.waiting_handlers > 0 {
                // a task will call back later
                return;
            }
        }

        let (alert_done, fired_on) = {
            let state = event.state();
            (state.alert_done, state.channels.clone())
        };

        if alert_done {
            let notice = Event::done_notice(event);
            self.fire_to(notice, &fired_on);
        }

        if error.is_none() && event.wants_success() {
            let channels = event
                .success_channel_override()
                .map(<[Channel]>::to_vec)
                .unwrap_or_else(|| fired_on.clone());
            let notice = Event::success_notice(event);
            self.fire_to(notice, &channels);
        }

        if let Some(slot) = event.value() {
            slot.inform(true);
        }

        // cause walk: each settled event decrements its own effects; once a
        // link hits zero it is detached and the walk climbs to its cause
        let mut current = event.clone();
        loop {
            let cause = {
                let mut state = current.state();
                let Some(cause) = state.cause.clone() else {
                    break;
                };
                state.effects = state.effects.saturating_sub(1);
                if state.effects > 0 {
                    break;
                }
                state.cause = None;
                cause
            };

            if current.wants_complete() {
                let channels = current
                    .complete_channel_override()
                    .map(<[Channel]>::to_vec)
                    .unwrap_or_else(|| current.channels());
                let notice = Event::complete_notice(&current);
                self.fire_to(notice, &channels);
            }

            current = cause;
        }
    }
}
