//! Tasks: cooperative suspension for handlers that cannot finish in one
//! call.
//!
//! A suspended handler is a [`Flow`]: an explicit state machine the
//! scheduler advances once per tick. Flows stand in for the lazy sequences
//! of coroutine-based kernels; `advance` is the `yield` boundary.
use crate::*;

/// One step of a [`Flow`].
pub enum Step {
    /// Nothing to do yet; advance again next tick.
    Idle,
    /// A produced value; overwrites the event's [`Value`]. The flow stays
    /// registered.
    Value(Arc<dyn Payload>),
    /// Suspend into a nested flow; the current flow resumes once the nested
    /// one finishes.
    Suspend(Box<dyn Flow>),
    /// A resolved [`call`]: the parent flow is resumed with this promise.
    Call(Value),
    /// The flow is exhausted. Must be returned again on further advances.
    Done,
    /// The flow failed; surfaced like a handler fault.
    Failed(BoxError),
}

impl Step {
    /// Wraps a concrete value.
    pub fn value(value: impl Payload) -> Self {
        Self::Value(Arc::new(value))
    }

    /// Wraps a nested suspension.
    pub fn suspend(flow: impl Flow + 'static) -> Self {
        Self::Suspend(Box::new(flow))
    }
}

/// A suspended handler, advanced cooperatively by the scheduler.
///
/// Once a flow has returned [`Step::Done`] it must keep returning it; the
/// scheduler may advance an exhausted flow once more before settling it.
pub trait Flow: Send {
    /// Advances the state machine by one step. `resume` carries the promise
    /// of a resolved [`call`] when the flow is woken by one.
    fn advance(&mut self, ctx: &mut Ctx<'_>, resume: Option<Value>) -> Step;
}

// Automatic impl so plain closures can act as flows.
impl<F> Flow for F
where
    F: FnMut(&mut Ctx<'_>, Option<Value>) -> Step + Send,
{
    fn advance(&mut self, ctx: &mut Ctx<'_>, resume: Option<Value>) -> Step {
        (self)(ctx, resume)
    }
}

/// A registered task: an event still owing work, the flow owing it, and the
/// parent flow to resume once a nested flow finishes.
pub(crate) struct TaskRecord {
    pub event: Arc<Event>,
    pub flow: Box<dyn Flow>,
    pub parent: Option<Box<dyn Flow>>,
}

impl Manager {
    /// Advances one task by one step and reconciles the task list with the
    /// result.
    pub(crate) fn process_task(&mut self, record: TaskRecord) {
        let TaskRecord {
            event,
            mut flow,
            parent,
        } = record;

        let step = {
            let mut ctx = Ctx::root(self);
            flow.advance(&mut ctx, None)
        };

        match step {
            Step::Idle => {
                self.tasks.push(TaskRecord {
                    event,
                    flow,
                    parent,
                });
            }
            Step::Value(value) => {
                if let Some(slot) = event.value() {
                    slot.set(value);
                }
                self.tasks.push(TaskRecord {
                    event,
                    flow,
                    parent,
                });
            }
            Step::Suspend(child) => {
                event.state().waiting_handlers += 1;
                // the child replaces the current record and is advanced
                // immediately, so handlers it installs take effect within
                // the same tick
                self.process_task(TaskRecord {
                    event,
                    flow: child,
                    parent: Some(flow),
                });
            }
            Step::Call(value) => {
                self.resume_parent(event, parent, value);
            }
            Step::Done => {
                {
                    let mut state = event.state();
                    state.waiting_handlers = state.waiting_handlers.saturating_sub(1);
                }
                if let Some(parent) = parent {
                    self.tasks.push(TaskRecord {
                        event,
                        flow: parent,
                        parent: None,
                    });
                } else if event.waiting_handlers() == 0 {
                    if let Some(slot) = event.value() {
                        slot.inform(true);
                    }
                    self.event_done(&event, None);
                }
            }
            Step::Failed(boxed) => {
                self.task_failed(&event, boxed);
            }
        }
    }

    /// A [`call`] resolved: wake the parent flow with the promise and sort
    /// its next step into the task list.
    fn resume_parent(&mut self, event: Arc<Event>, parent: Option<Box<dyn Flow>>, value: Value) {
        let Some(mut parent) = parent else {
            // a top-level call flow has nobody to resume; settle it
            warn!("CALL RESOLVED WITHOUT PARENT FLOW FOR {:?}", event);
            let mut state = event.state();
            state.waiting_handlers = state.waiting_handlers.saturating_sub(1);
            let waiting = state.waiting_handlers;
            drop(state);
            if waiting == 0 {
                if let Some(slot) = event.value() {
                    slot.inform(true);
                }
                self.event_done(&event, None);
            }
            return;
        };

        let step = {
            let mut ctx = Ctx::root(self);
            parent.advance(&mut ctx, Some(value))
        };

        match step {
            Step::Suspend(child) => {
                // one suspension traded for another; the waiting-handler
                // count is unchanged
                self.process_task(TaskRecord {
                    event,
                    flow: child,
                    parent: Some(parent),
                });
            }
            Step::Failed(boxed) => {
                self.task_failed(&event, boxed);
            }
            step => {
                if let Step::Value(value) = step {
                    if let Some(slot) = event.value() {
                        slot.set(value);
                    }
                }
                // the resolved call flow is gone; the parent carries on as a
                // plain task (an exhausted parent settles on its next
                // advance)
                {
                    let mut state = event.state();
                    state.waiting_handlers = state.waiting_handlers.saturating_sub(1);
                }
                self.tasks.push(TaskRecord {
                    event,
                    flow: parent,
                    parent: None,
                });
            }
        }
    }

    /// A flow failed: poison and settle the value, emit the failure events,
    /// drop the task.
    fn task_failed(&mut self, event: &Arc<Event>, boxed: BoxError) {
        let handler = event.state().handler;
        let fault = Fault::capture(boxed, handler);
        warn!("FAULT IN TASK FOR {:?}: {}", event, fault.message());

        if let Some(slot) = event.value() {
            slot.set(Arc::new(fault.clone()));
            slot.poison();
            slot.inform(true);
        }
        if event.wants_failure() {
            let fired_on = event.channels();
            let notice = Event::failure_notice(event, fault.clone());
            self.fire_to(notice, &fired_on);
        }
        self.fire(Event::error_notice(fault));
    }
}

/// Suspends until an event named `name` has been fully handled on one of
/// the given channels (empty defaults to `Any`).
///
/// Installs a transient intercept handler that flags the matching event for
/// a `<name>_done` notice, and a second handler waiting for that notice.
/// Both are removed again once the wait resolves.
pub fn wait(name: impl Into<String>, channels: &[Channel]) -> WaitFlow {
    let channels = if channels.is_empty() {
        vec![Channel::Any]
    } else {
        channels.to_vec()
    };
    WaitFlow {
        name: name.into(),
        channels,
        state: Arc::new(Mutex::new(WaitState::default())),
        installed: false,
    }
}

/// Fires an event and suspends until it has been fully handled, resolving
/// the caller with the event's promise.
///
/// Yield this from a parent [`Flow`]; the parent is resumed with the
/// promise once every handler of the called event has settled.
pub fn call(event: Event, channels: &[Channel]) -> CallFlow {
    CallFlow {
        pending: Some((event, channels.to_vec())),
        wait: None,
        value: None,
        finished: false,
    }
}

#[derive(Default)]
struct WaitState {
    /// The intercept ran; the target event is flagged.
    run: bool,
    /// The done notice arrived.
    flag: bool,
    /// Id of the intercepted event.
    source: Option<EventId>,
    on_event: Vec<HandlerId>,
    on_done: Vec<HandlerId>,
}

/// The flow behind [`wait`].
pub struct WaitFlow {
    name: String,
    channels: Vec<Channel>,
    state: Arc<Mutex<WaitState>>,
    installed: bool,
}

impl Flow for WaitFlow {
    fn advance(&mut self, ctx: &mut Ctx<'_>, _resume: Option<Value>) -> Step {
        if !self.installed {
            self.installed = true;
            let done = done_name(&self.name);
            for channel in &self.channels {
                let state = self.state.clone();
                let on_event = ctx.add_handler(
                    Handler::new(&self.name, move |_ctx, event| {
                        let mut state = state.lock();
                        if !state.run {
                            state.run = true;
                            state.source = Some(event.id());
                            event.set_alert_done(true);
                        }
                        Ok(Outcome::Pass)
                    })
                    .channel(channel.clone()),
                );

                let state = self.state.clone();
                let on_done = ctx.add_handler(
                    Handler::new(&done, move |_ctx, event| {
                        if let Some(notice) = event.payload::<Notice>() {
                            let mut state = state.lock();
                            if state.source == Some(notice.source) {
                                state.flag = true;
                            }
                        }
                        Ok(Outcome::Pass)
                    })
                    .channel(channel.clone()),
                );

                let mut state = self.state.lock();
                state.on_event.push(on_event);
                state.on_done.push(on_done);
            }
        }

        let (run, flag) = {
            let state = self.state.lock();
            (state.run, state.flag)
        };

        if run {
            let stale: Vec<HandlerId> = self.state.lock().on_event.drain(..).collect();
            for id in stale {
                ctx.remove_handler(id, Some(&self.name));
            }
        }

        if flag {
            let done = done_name(&self.name);
            let stale: Vec<HandlerId> = self.state.lock().on_done.drain(..).collect();
            for id in stale {
                ctx.remove_handler(id, Some(&done));
            }
            Step::Done
        } else {
            Step::Idle
        }
    }
}

/// The flow behind [`call`].
pub struct CallFlow {
    pending: Option<(Event, Vec<Channel>)>,
    wait: Option<WaitFlow>,
    value: Option<Value>,
    finished: bool,
}

impl Flow for CallFlow {
    fn advance(&mut self, ctx: &mut Ctx<'_>, _resume: Option<Value>) -> Step {
        if self.finished {
            return Step::Done;
        }

        if let Some((event, channels)) = self.pending.take() {
            let resolved = ctx.resolve_channels(&event, &channels);
            let name = event.name().to_owned();
            let value = ctx.fire_to(event, &resolved);
            self.wait = Some(wait(name, &resolved));
            self.value = Some(value);
        }

        let waiting = self.wait.as_mut().expect("call flow fired its event");
        match waiting.advance(ctx, None) {
            Step::Done => {
                self.finished = true;
                let value = self.value.clone().expect("call flow kept its promise");
                Step::Call(value)
            }
            step => step,
        }
    }
}
