//! The run loop: `tick` orchestration, lifecycle, signals and the
//! cross-thread wake bridge.
use crate::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Poll interval when the fallback generator is the only event source.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_millis(10);

/// Priority of the built-in fallback `generate_events` handler; real event
/// sources always fire first.
pub(crate) const FALLBACK_PRIORITY: f64 = -100.0;

impl Manager {
    /// One scheduler iteration: advance suspended tasks, poll event sources
    /// via `generate_events` (when running), flush the queue.
    ///
    /// `timeout` bounds how long event sources may wait for new events;
    /// `None` leaves them unbounded. Usable as an embeddable main loop.
    pub fn tick(&mut self, timeout: Option<Duration>) {
        self.executing_thread = Some(std::thread::current().id());

        let pending = std::mem::take(&mut self.tasks);
        for record in pending {
            self.process_task(record);
        }

        if self.running() {
            let budget = TimeBudget::new(timeout);
            let probe = Event::generate_events(budget.clone());
            if self
                .collect_handlers(&probe, &Channel::Any, true)
                .len()
                == 1
            {
                // no event source besides the fallback: don't wait longer
                // than the idle interval
                budget.reduce(IDLE_TIMEOUT);
            }
            if !self.tasks.is_empty() || self.queued() > 0 {
                // work remains: poll without sleeping
                budget.reduce(Duration::ZERO);
            }
            self.fire_to(probe, &[Channel::Any]);
        }

        if self.queued() > 0 {
            self.flush();
        }

        self.executing_thread = None;
    }

    /// Runs this manager until [`stop`](Manager::stop) is requested.
    ///
    /// Fires `started`, then ticks continuously. On the process's main
    /// thread, SIGINT and SIGTERM are translated into a `signal` event
    /// followed by a stop request; installation failures are tolerated.
    pub fn run(&mut self) {
        if std::thread::current().name() == Some("main") {
            signals::install();
        }

        self.set_running(true);

        if self.fallback.is_none() {
            let wake = Arc::new(WakeState::default());
            {
                let wake = wake.clone();
                *self.resume.lock() = Some(Arc::new(move || wake.wake()) as ResumeFn);
            }
            let id = self.register(fallback_component(wake));
            self.fallback = Some(id);
        }

        info!("RUN {} ({})", self.name, self.id);
        let started = Event::started(self.id);
        self.fire(started);

        while self.queued() > 0 || self.running() {
            if let Some(signum) = signals::take() {
                info!("SIGNAL {signum} RECEIVED");
                self.fire(Event::signal(signum));
                if signum == nix::libc::SIGINT || signum == nix::libc::SIGTERM {
                    self.stop();
                }
            }
            self.tick(None);
        }

        // drain stragglers
        self.tick(None);
    }

    /// Hands the run loop to a fresh thread or a forked process. The caller
    /// keeps interacting through the returned [`Spawned`] handle.
    pub fn start(mut self, mode: Spawn) -> Result<Spawned, SpawnError> {
        let emitter = self.emitter();
        match mode {
            Spawn::Thread => {
                let handle = std::thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || {
                        self.run();
                        self
                    })?;
                Ok(Spawned {
                    emitter,
                    thread: Some(handle),
                    child: None,
                })
            }
            Spawn::Process => match unsafe { nix::unistd::fork() }? {
                nix::unistd::ForkResult::Child => {
                    self.run();
                    std::process::exit(0);
                }
                nix::unistd::ForkResult::Parent { child } => Ok(Spawned {
                    emitter,
                    thread: None,
                    child: Some(child),
                }),
            },
        }
    }

    /// Stops this manager: flips the running flag, drops pending
    /// `generate_events` from the queue (they must not block shutdown),
    /// fires `stopped` and runs three drain ticks.
    pub fn stop(&mut self) {
        if !self.running() {
            return;
        }
        self.stop_deferred();
        for _ in 0..3 {
            self.tick(None);
        }
    }

    /// The stop request without the drain ticks; used from inside dispatch,
    /// where the surrounding loop performs the drain.
    pub(crate) fn stop_deferred(&mut self) {
        if !self.running() {
            return;
        }
        self.set_running(false);
        {
            self.queue
                .lock()
                .retain(|(event, _)| event.name() != names::GENERATE_EVENTS);
        }
        info!("STOP {} ({})", self.name, self.id);
        let stopped = Event::stopped(self.id);
        self.fire(stopped);
    }
}

// The wake-up bridge.
impl Manager {
    /// A clonable handle for foreign threads: fire events into this tree's
    /// root queue and wake the sleeping loop.
    pub fn emitter(&self) -> Emitter {
        Emitter {
            queue: self.queue.clone(),
            resume: self.resume.clone(),
            running: self.running.clone(),
            root: self.id,
        }
    }

    /// Installs the wake callback invoked on every enqueue. Set by an idle
    /// event source blocking on a selector or condition.
    pub fn set_resume(&self, resume: impl Fn() + Send + Sync + 'static) {
        *self.resume.lock() = Some(Arc::new(resume));
    }

    /// Removes the wake callback.
    pub fn clear_resume(&self) {
        *self.resume.lock() = None;
    }
}

/// How [`Manager::start`] hands off the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawn {
    /// A named thread in this process.
    Thread,
    /// A forked child process.
    Process,
}

/// A manager handed off to a thread or process.
pub struct Spawned {
    emitter: Emitter,
    thread: Option<std::thread::JoinHandle<Manager>>,
    child: Option<nix::unistd::Pid>,
}

impl Spawned {
    /// A handle for firing events into the running tree.
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    /// Requests a stop.
    pub fn stop(&self) {
        self.emitter.stop();
    }

    /// Waits for a thread-backed runner and reclaims the manager.
    pub fn join(self) -> Option<Manager> {
        self.thread.and_then(|handle| handle.join().ok())
    }

    /// Pid of a process-backed runner.
    pub fn pid(&self) -> Option<i32> {
        self.child.map(|pid| pid.as_raw())
    }
}

/// Fires events into a manager tree from foreign threads.
///
/// Appending wakes the sleeping root through the `needs_resume` bridge.
/// Cross-thread fires never take part in cause/effect tracking.
#[derive(Clone)]
pub struct Emitter {
    queue: Arc<Mutex<VecDeque<Queued>>>,
    resume: Arc<Mutex<Option<ResumeFn>>>,
    running: Arc<AtomicBool>,
    root: ComponentId,
}

impl Emitter {
    /// Fires an event; empty channels resolve from the event, then to
    /// `Any`. Returns the attached promise.
    pub fn fire(&self, event: Event, channels: &[Channel]) -> Value {
        let channels = crate::manager::resolve_channels(&event, channels, None);
        let value = Value::new(event.wants_notify());
        let event = Arc::new(event);
        if !event.is_silent() {
            debug!("FIRE {:?} -> {:?} (foreign)", event, channels);
        }
        {
            let mut state = event.state();
            state.channels = channels.clone();
            state.value = Some(value.clone());
        }
        self.queue.lock().push_back((event, channels));
        self.wake();
        value
    }

    /// Whether the loop is (still) running.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests a stop: flips the running flag, drops pending
    /// `generate_events` and fires `stopped`; the loop drains and exits.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            self.queue
                .lock()
                .retain(|(event, _)| event.name() != names::GENERATE_EVENTS);
        }
        self.fire(Event::stopped(self.root), &[]);
    }

    fn wake(&self) {
        let wake = self.resume.lock().clone();
        if let Some(wake) = wake {
            wake();
        }
    }
}

/// Condition the fallback generator parks on; `wake` is the installed
/// resume callback. The pending flag closes the enqueue/park race.
#[derive(Default)]
pub(crate) struct WakeState {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl WakeState {
    pub(crate) fn wake(&self) {
        *self.pending.lock() = true;
        self.cv.notify_one();
    }

    pub(crate) fn sleep(&self, limit: Option<Duration>) {
        // never park unbounded: keeps signal latency bounded even when a
        // source forgot to shrink the budget
        let limit = limit.unwrap_or(IDLE_TIMEOUT);
        let mut pending = self.pending.lock();
        if !*pending && !limit.is_zero() {
            let _ = self.cv.wait_for(&mut pending, limit);
        }
        *pending = false;
    }
}

/// The built-in idle event source: sleeps away the remaining poll budget
/// when nothing else will, and is woken by the resume callback.
fn fallback_component(wake: Arc<WakeState>) -> Manager {
    let mut fallback = Manager::new("fallback");
    fallback.add_handler(
        Handler::new(names::GENERATE_EVENTS, move |_ctx, event| {
            if let Some(budget) = event.payload::<TimeBudget>() {
                wake.sleep(budget.remaining());
                budget.reduce(Duration::ZERO);
            }
            Ok(Outcome::Pass)
        })
        .priority(FALLBACK_PRIORITY),
    );
    fallback
}

mod signals {
    //! Process-wide signal capture: installed once, from the initial thread
    //! only; the run loop polls and translates into `signal` events.
    use nix::libc::c_int;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    static INSTALLED: AtomicBool = AtomicBool::new(false);
    static PENDING: AtomicI32 = AtomicI32::new(0);

    extern "C" fn note(signum: c_int) {
        PENDING.store(signum, Ordering::SeqCst);
    }

    pub(crate) fn install() {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return;
        }
        let action = SigAction::new(SigHandler::Handler(note), SaFlags::empty(), SigSet::empty());
        // installation failures are tolerated
        unsafe {
            let _ = sigaction(Signal::SIGINT, &action);
            let _ = sigaction(Signal::SIGTERM, &action);
        }
    }

    pub(crate) fn take() -> Option<i32> {
        match PENDING.swap(0, Ordering::SeqCst) {
            0 => None,
            signum => Some(signum),
        }
    }
}
