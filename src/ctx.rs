//! Handler Context
use crate::*;

/// The surface a running handler or [`Flow`] acts through.
///
/// Borrowed from the root manager for the duration of one invocation. Fires
/// resolve their default channel from the component owning the running
/// handler, exactly as if that component had fired the event itself.
pub struct Ctx<'c> {
    pub(crate) mgr: &'c mut Manager,
    owner: ComponentId,
    owner_channel: Option<Channel>,
}

impl<'c> Ctx<'c> {
    pub(crate) fn new(
        mgr: &'c mut Manager,
        owner: ComponentId,
        owner_channel: Option<Channel>,
    ) -> Self {
        Self {
            mgr,
            owner,
            owner_channel,
        }
    }

    pub(crate) fn root(mgr: &'c mut Manager) -> Self {
        let owner = mgr.id;
        let owner_channel = mgr.channel.clone();
        Self {
            mgr,
            owner,
            owner_channel,
        }
    }

    /// The component owning the running handler.
    pub fn owner(&self) -> ComponentId {
        self.owner
    }

    /// The owning component's channel, if any.
    pub fn owner_channel(&self) -> Option<&Channel> {
        self.owner_channel.as_ref()
    }

    /// Fires an event; channels default to the event's preset channels, then
    /// the owning component's channel, then `Any`. Returns the promise.
    pub fn fire(&mut self, event: Event) -> Value {
        self.mgr
            .fire_with(event, &[], self.owner_channel.as_ref())
    }

    /// Fires an event on explicit channels. Returns the promise.
    pub fn fire_to(&mut self, event: Event, channels: &[Channel]) -> Value {
        self.mgr
            .fire_with(event, channels, self.owner_channel.as_ref())
    }

    /// The channels a [`Ctx::fire`] of this event would resolve to.
    pub fn resolve_channels(&self, event: &Event, explicit: &[Channel]) -> Vec<Channel> {
        crate::manager::resolve_channels(event, explicit, self.owner_channel.as_ref())
    }

    /// Installs a transient handler on the root. Invalidates the cache.
    pub fn add_handler(&mut self, handler: Handler) -> HandlerId {
        self.mgr.add_handler(handler)
    }

    /// Removes a handler from the root. Tolerant; invalidates the cache.
    pub fn remove_handler(&mut self, id: HandlerId, name: Option<&str>) {
        self.mgr.remove_handler(id, name);
    }

    /// Requests a stop: flips the running flag, purges pending
    /// `generate_events` and fires `stopped`. The surrounding loop performs
    /// the drain; dispatch is never re-entered from inside a handler.
    pub fn stop(&mut self) {
        self.mgr.stop_deferred();
    }
}
