//! Events
use crate::*;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Unique identifier of a fired event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "e{}", self.0)
    }
}

/// A channel selector partitioning the handler namespace.
///
/// `Any` is the literal `"*"`; `Target` is directed delivery straight at one
/// component of the tree, bypassing the channel filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Matches every handler channel.
    Any,
    /// A named channel.
    Name(String),
    /// Directed delivery to a single component; never escapes its subtree.
    Target(ComponentId),
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        if name == "*" {
            Self::Any
        } else {
            Self::Name(name.to_owned())
        }
    }
}

impl From<String> for Channel {
    fn from(name: String) -> Self {
        if name == "*" {
            Self::Any
        } else {
            Self::Name(name)
        }
    }
}

impl From<ComponentId> for Channel {
    fn from(target: ComponentId) -> Self {
        Self::Target(target)
    }
}

/// Anything an event (or a handler return, or a [`Value`]) may carry.
///
/// Blanket-implemented; consumers downcast at the point of use:
///
/// ```rust
/// # use axon::prelude::*;
/// # let event = Event::new("tally").with_payload(3u32);
/// if let Some(n) = event.payload::<u32>() {
///     assert_eq!(*n, 3);
/// }
/// ```
pub trait Payload: Downcast + fmt::Debug + Send + Sync {}

use downcast_rs::impl_downcast;
impl_downcast!(Payload);

// Automatic impl for anything eligible.
impl<T> Payload for T where T: std::any::Any + fmt::Debug + Send + Sync {}

/// Well-known event names emitted by the kernel itself.
pub(crate) mod names {
    pub const STARTED: &str = "started";
    pub const STOPPED: &str = "stopped";
    pub const SIGNAL: &str = "signal";
    pub const GENERATE_EVENTS: &str = "generate_events";
    pub const ERROR: &str = "error";
}

/// Name of the `done` notice derived from an event name.
pub fn done_name(source: &str) -> String {
    format!("{source}_done")
}

/// Name of the `success` notice derived from an event name.
pub fn success_name(source: &str) -> String {
    format!("{source}_success")
}

/// Name of the `failure` notice derived from an event name.
pub fn failure_name(source: &str) -> String {
    format!("{source}_failure")
}

/// Name of the `complete` notice derived from an event name.
pub fn complete_name(source: &str) -> String {
    format!("{source}_complete")
}

/// A named, channeled message dispatched through the kernel.
///
/// Construction is builder-style; everything set before [`fire`]
/// (`Manager::fire`) is immutable by convention afterwards. The kernel keeps
/// its own transient dispatch state behind a lock so a fired event can be
/// shared between the queue, running tasks and the cause chain.
pub struct Event {
    id: EventId,
    name: String,
    payload: Option<Arc<dyn Payload>>,
    preset: Vec<Channel>,
    silent: bool,
    success: bool,
    failure: bool,
    complete: bool,
    notify: bool,
    success_channels: Option<Vec<Channel>>,
    complete_channels: Option<Vec<Channel>>,
    state: Mutex<EventState>,
}

/// Transient dispatch state of a fired event.
#[derive(Default)]
pub(crate) struct EventState {
    /// Channels the event was actually fired on.
    pub channels: Vec<Channel>,
    /// The promise attached at fire time.
    pub value: Option<Value>,
    /// Outstanding suspended handlers.
    pub waiting_handlers: u32,
    /// Parent event driving completion tracking.
    pub cause: Option<Arc<Event>>,
    /// Outstanding nested events, plus one for the event itself.
    pub effects: u32,
    /// Fire a `<name>_done` notice once all handlers have settled.
    pub alert_done: bool,
    /// Handler currently (or last) invoked for this event.
    pub handler: Option<HandlerId>,
}

impl Event {
    /// Creates a new event. Names are lowercase identifiers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EventId::next(),
            name: name.into(),
            payload: None,
            preset: Vec::new(),
            silent: false,
            success: false,
            failure: false,
            complete: false,
            notify: false,
            success_channels: None,
            complete_channels: None,
            state: Mutex::new(EventState::default()),
        }
    }

    /// Attaches a payload; handlers downcast it via [`Event::payload`].
    pub fn with_payload(mut self, payload: impl Payload) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Adds a preset channel, used when `fire` receives no channels.
    pub fn channel(mut self, channel: impl Into<Channel>) -> Self {
        self.preset.push(channel.into());
        self
    }

    /// Suppresses per-dispatch logging for this event.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Requests a `<name>_success` notice once all handlers (and their
    /// immediate follow-up events) ran without error.
    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Requests a `<name>_failure` notice when a handler fails.
    pub fn failure(mut self, failure: bool) -> Self {
        self.failure = failure;
        self
    }

    /// Requests a `<name>_complete` notice once every transitively caused
    /// event has settled.
    pub fn complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }

    /// Requests notification through the attached [`Value`].
    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// Overrides the channels the `success` notice is fired on.
    pub fn success_channels(mut self, channels: Vec<Channel>) -> Self {
        self.success_channels = Some(channels);
        self
    }

    /// Overrides the channels the `complete` notice is fired on.
    pub fn complete_channels(mut self, channels: Vec<Channel>) -> Self {
        self.complete_channels = Some(channels);
        self
    }

    /// The event's unique id.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// The event's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload, downcast to `T`.
    pub fn payload<T: Payload>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref())
    }

    /// The payload as a shared trait object.
    pub fn payload_arc(&self) -> Option<Arc<dyn Payload>> {
        self.payload.clone()
    }

    /// The channels the event was fired on (empty before firing).
    pub fn channels(&self) -> Vec<Channel> {
        self.state.lock().channels.clone()
    }

    /// The promise attached at fire time.
    pub fn value(&self) -> Option<Value> {
        self.state.lock().value.clone()
    }

    /// Outstanding suspended handlers for this event.
    pub fn waiting_handlers(&self) -> u32 {
        self.state.lock().waiting_handlers
    }

    /// Marks the event so that a `<name>_done` notice fires once all of its
    /// handlers have settled. Used by [`wait`](crate::task::wait).
    pub fn set_alert_done(&self, alert: bool) {
        self.state.lock().alert_done = alert;
    }

    pub(crate) fn is_silent(&self) -> bool {
        self.silent
    }

    pub(crate) fn wants_success(&self) -> bool {
        self.success
    }

    pub(crate) fn wants_failure(&self) -> bool {
        self.failure
    }

    pub(crate) fn wants_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn wants_notify(&self) -> bool {
        self.notify
    }

    pub(crate) fn preset_channels(&self) -> &[Channel] {
        &self.preset
    }

    pub(crate) fn success_channel_override(&self) -> Option<&[Channel]> {
        self.success_channels.as_deref()
    }

    pub(crate) fn complete_channel_override(&self) -> Option<&[Channel]> {
        self.complete_channels.as_deref()
    }

    pub(crate) fn state(&self) -> parking_lot::MutexGuard<'_, EventState> {
        self.state.lock()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Event")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("payload", &self.payload)
            .finish()
    }
}

// Kernel-emitted events.
impl Event {
    pub(crate) fn started(component: ComponentId) -> Self {
        Self::new(names::STARTED).with_payload(component)
    }

    pub(crate) fn stopped(component: ComponentId) -> Self {
        Self::new(names::STOPPED).with_payload(component)
    }

    pub(crate) fn signal(signum: i32) -> Self {
        Self::new(names::SIGNAL).with_payload(signum)
    }

    pub(crate) fn generate_events(budget: TimeBudget) -> Self {
        Self::new(names::GENERATE_EVENTS)
            .with_payload(budget)
            .silent(true)
    }

    pub(crate) fn done_notice(source: &Arc<Event>) -> Self {
        Self::new(done_name(source.name())).with_payload(Notice::of(source))
    }

    pub(crate) fn success_notice(source: &Arc<Event>) -> Self {
        Self::new(success_name(source.name())).with_payload(Notice::of(source))
    }

    pub(crate) fn complete_notice(source: &Arc<Event>) -> Self {
        Self::new(complete_name(source.name())).with_payload(Notice::of(source))
    }

    pub(crate) fn failure_notice(source: &Arc<Event>, fault: Fault) -> Self {
        Self::new(failure_name(source.name())).with_payload(FaultNotice {
            source: source.id(),
            source_name: source.name().to_owned(),
            fault,
        })
    }

    pub(crate) fn error_notice(fault: Fault) -> Self {
        Self::new(names::ERROR).with_payload(fault)
    }
}

/// Payload of the derived `done` / `success` / `complete` notices.
#[derive(Debug, Clone)]
pub struct Notice {
    /// Id of the event this notice is about.
    pub source: EventId,
    /// Name of the event this notice is about.
    pub source_name: String,
    /// The source event's value at the time the notice fired.
    pub value: Option<Arc<dyn Payload>>,
}

impl Notice {
    fn of(source: &Arc<Event>) -> Self {
        Self {
            source: source.id(),
            source_name: source.name().to_owned(),
            value: source.value().and_then(|v| v.get()),
        }
    }
}

/// Payload of the derived `<name>_failure` notice.
#[derive(Debug, Clone)]
pub struct FaultNotice {
    /// Id of the failed event.
    pub source: EventId,
    /// Name of the failed event.
    pub source_name: String,
    /// The captured handler failure.
    pub fault: Fault,
}

/// The shrinking poll budget carried by `generate_events`.
///
/// Event sources must treat the remaining budget as a maximum poll interval;
/// it only ever shrinks. `None` means unbounded.
#[derive(Debug, Clone)]
pub struct TimeBudget(Arc<Mutex<Option<Duration>>>);

impl TimeBudget {
    /// A fresh budget; `None` is unbounded.
    pub fn new(limit: Option<Duration>) -> Self {
        Self(Arc::new(Mutex::new(limit)))
    }

    /// Shrinks the budget to at most `limit`.
    pub fn reduce(&self, limit: Duration) {
        let mut slot = self.0.lock();
        match *slot {
            Some(current) if current <= limit => {}
            _ => *slot = Some(limit),
        }
    }

    /// The remaining budget.
    pub fn remaining(&self) -> Option<Duration> {
        *self.0.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_only_shrinks() {
        let budget = TimeBudget::new(None);
        assert_eq!(budget.remaining(), None);

        budget.reduce(Duration::from_millis(50));
        assert_eq!(budget.remaining(), Some(Duration::from_millis(50)));

        budget.reduce(Duration::from_millis(200));
        assert_eq!(budget.remaining(), Some(Duration::from_millis(50)));

        budget.reduce(Duration::ZERO);
        assert_eq!(budget.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn derived_notice_names() {
        assert_eq!(done_name("ping"), "ping_done");
        assert_eq!(success_name("ping"), "ping_success");
        assert_eq!(failure_name("ping"), "ping_failure");
        assert_eq!(complete_name("ping"), "ping_complete");
    }

    #[test]
    fn channel_from_str() {
        assert_eq!(Channel::from("*"), Channel::Any);
        assert_eq!(Channel::from("web"), Channel::Name("web".into()));
    }
}
