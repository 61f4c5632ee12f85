//! Handlers
use crate::*;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "h{}", self.0)
    }
}

/// What a handler hands back to the dispatcher.
pub enum Outcome {
    /// No value; dispatch continues unchanged.
    Pass,
    /// A concrete value; overwrites the event's [`Value`].
    Value(Arc<dyn Payload>),
    /// A suspension: the [`Flow`] is advanced once per tick until done.
    Suspend(Box<dyn Flow>),
}

impl Outcome {
    /// Wraps a concrete value.
    pub fn value(value: impl Payload) -> Self {
        Self::Value(Arc::new(value))
    }

    /// Wraps a suspension.
    pub fn suspend(flow: impl Flow + 'static) -> Self {
        Self::Suspend(Box::new(flow))
    }
}

/// The callable form of a handler.
pub type HandlerFn =
    Box<dyn FnMut(&mut Ctx<'_>, &Arc<Event>) -> Result<Outcome, BoxError> + Send>;

/// A handler under construction; register it with `Manager::add_handler`.
///
/// ```rust
/// # use axon::prelude::*;
/// let echo = Handler::new("ping", |_ctx: &mut Ctx<'_>, _event: &Arc<Event>| {
///     Ok(Outcome::value("pong"))
/// })
/// .channel("net")
/// .priority(2.0);
/// ```
pub struct Handler {
    pub(crate) names: Vec<String>,
    pub(crate) channel: Option<Channel>,
    pub(crate) priority: f64,
    pub(crate) filter: bool,
    pub(crate) func: HandlerFn,
}

impl Handler {
    /// A handler matching one event name.
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: FnMut(&mut Ctx<'_>, &Arc<Event>) -> Result<Outcome, BoxError> + Send + 'static,
    {
        Self {
            names: vec![name.to_owned()],
            channel: None,
            priority: 0.0,
            filter: false,
            func: Box::new(func),
        }
    }

    /// A handler matching every event name on its manager.
    pub fn wildcard<F>(func: F) -> Self
    where
        F: FnMut(&mut Ctx<'_>, &Arc<Event>) -> Result<Outcome, BoxError> + Send + 'static,
    {
        Self {
            names: Vec::new(),
            channel: None,
            priority: 0.0,
            filter: false,
            func: Box::new(func),
        }
    }

    /// Adds further event names this handler matches.
    pub fn also(mut self, name: &str) -> Self {
        self.names.push(name.to_owned());
        self
    }

    /// Pins the handler to a channel. Unset handlers inherit the channel of
    /// the component they are registered on.
    pub fn channel(mut self, channel: impl Into<Channel>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Dispatch priority; higher fires first.
    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the handler as a filter: a truthy return short-circuits the
    /// remaining handlers of the event.
    pub fn filter(mut self, filter: bool) -> Self {
        self.filter = filter;
        self
    }
}

/// A registered handler. Shared between the registry, the resolution cache
/// and in-flight dispatch snapshots.
pub(crate) struct HandlerEntry {
    pub id: HandlerId,
    pub names: Vec<String>,
    /// Effective channel: the handler's own, else the owning component's.
    pub channel: Option<Channel>,
    pub priority: f64,
    pub filter: bool,
    pub owner: ComponentId,
    pub owner_channel: Option<Channel>,
    pub func: Mutex<HandlerFn>,
}

impl HandlerEntry {
    /// The channel-matching rule: wildcard queries match everything, wildcard
    /// handlers match every query, otherwise channels must agree. Directed
    /// queries bypass the filter entirely.
    pub fn matches(&self, query: &Channel) -> bool {
        match query {
            Channel::Any => true,
            Channel::Target(_) => true,
            query => match &self.channel {
                Some(Channel::Any) => true,
                Some(channel) => channel == query,
                None => false,
            },
        }
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("names", &self.names)
            .field("channel", &self.channel)
            .field("priority", &self.priority)
            .field("filter", &self.filter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(channel: Option<Channel>) -> HandlerEntry {
        HandlerEntry {
            id: HandlerId::next(),
            names: vec!["x".into()],
            channel,
            priority: 0.0,
            filter: false,
            owner: ComponentId::next(),
            owner_channel: None,
            func: Mutex::new(Box::new(|_ctx, _event| Ok(Outcome::Pass))),
        }
    }

    #[test]
    fn channel_matching() {
        let unchanneled = entry(None);
        let wildcard = entry(Some(Channel::Any));
        let named = entry(Some(Channel::Name("web".into())));

        let any = Channel::Any;
        let web = Channel::Name("web".into());
        let db = Channel::Name("db".into());
        let directed = Channel::Target(ComponentId::next());

        assert!(unchanneled.matches(&any));
        assert!(!unchanneled.matches(&web));
        assert!(unchanneled.matches(&directed));

        assert!(wildcard.matches(&any));
        assert!(wildcard.matches(&web));
        assert!(wildcard.matches(&db));

        assert!(named.matches(&any));
        assert!(named.matches(&web));
        assert!(!named.matches(&db));
    }
}
