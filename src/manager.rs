//! Managers: the nodes of the component tree.
//!
//! Every component is a manager. A detached manager is its own root; owning
//! a subtree *is* rootness. The root holds the live queue, the resolution
//! cache and the task list, and is the only manager events are dispatched
//! on.
use crate::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;

/// Unique identifier of a component in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u64);

impl ComponentId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "c{}", self.0)
    }
}

/// An event waiting in the root queue, with the channels it was fired on.
pub(crate) type Queued = (Arc<Event>, Vec<Channel>);

/// The shared wake callback installed by an idle event source.
pub(crate) type ResumeFn = Arc<dyn Fn() + Send + Sync>;

pub(crate) type CacheKey = (String, Vec<Channel>);

/// A component: owner of handlers and child components.
///
/// Fire events with [`Manager::fire`], register handlers and children, and
/// drive everything with [`tick`](Manager::tick) or [`run`](Manager::run).
pub struct Manager {
    pub(crate) id: ComponentId,
    pub(crate) name: String,
    pub(crate) channel: Option<Channel>,
    /// Per-name handler buckets; `"*"` holds this manager's name-wildcards.
    pub(crate) handlers: HashMap<String, Vec<Arc<HandlerEntry>>>,
    /// Wildcard-name, wildcard-channel handlers.
    pub(crate) globals: Vec<Arc<HandlerEntry>>,
    pub(crate) components: Vec<Manager>,
    /// The live queue; the sole cross-thread surface.
    pub(crate) queue: Arc<Mutex<VecDeque<Queued>>>,
    /// Resolution cache, keyed by `(name, channels)`. Root only.
    pub(crate) cache: HashMap<CacheKey, Arc<[Arc<HandlerEntry>]>>,
    pub(crate) tasks: Vec<TaskRecord>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) executing_thread: Option<ThreadId>,
    pub(crate) currently_handling: Option<Arc<Event>>,
    /// Wake bridge for foreign threads; set while the root can sleep.
    pub(crate) resume: Arc<Mutex<Option<ResumeFn>>>,
    pub(crate) fallback: Option<ComponentId>,
}

impl Manager {
    /// Creates a new, detached manager.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ComponentId::next(),
            name: name.into(),
            channel: None,
            handlers: HashMap::new(),
            globals: Vec::new(),
            components: Vec::new(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            cache: HashMap::new(),
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            executing_thread: None,
            currently_handling: None,
            resume: Arc::new(Mutex::new(None)),
            fallback: None,
        }
    }

    /// Assigns this component's channel; unchanneled handlers registered on
    /// it inherit it, and events it fires default to it.
    pub fn with_channel(mut self, channel: impl Into<Channel>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// This component's id.
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// This component's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This component's channel, if any.
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Whether the run loop is active.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of events waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of suspended tasks waiting to be advanced.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Manager")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("components", &self.components.len())
            .field("queued", &self.queued())
            .finish()
    }
}

// Handler registry.
impl Manager {
    /// Registers a handler on this manager. Invalidates the cache.
    pub fn add_handler(&mut self, handler: Handler) -> HandlerId {
        let Handler {
            names,
            channel,
            priority,
            filter,
            func,
        } = handler;

        let entry = Arc::new(HandlerEntry {
            id: HandlerId::next(),
            // no channel of its own: inherit the component's
            channel: channel.clone().or_else(|| self.channel.clone()),
            names,
            priority,
            filter,
            owner: self.id,
            owner_channel: self.channel.clone(),
            func: Mutex::new(func),
        });

        if entry.names.is_empty() && channel == Some(Channel::Any) {
            self.globals.push(entry.clone());
        } else if entry.names.is_empty() {
            self.handlers
                .entry("*".to_owned())
                .or_default()
                .push(entry.clone());
        } else {
            for name in &entry.names {
                self.handlers
                    .entry(name.clone())
                    .or_default()
                    .push(entry.clone());
            }
        }

        self.cache.clear();
        entry.id
    }

    /// Removes a handler, from one name bucket or from all of them.
    /// Unknown handlers and buckets are tolerated. Invalidates the cache.
    pub fn remove_handler(&mut self, id: HandlerId, name: Option<&str>) {
        match name {
            Some(name) => {
                if let Some(bucket) = self.handlers.get_mut(name) {
                    bucket.retain(|entry| entry.id != id);
                    if bucket.is_empty() {
                        self.handlers.remove(name);
                    }
                }
            }
            None => {
                self.globals.retain(|entry| entry.id != id);
                self.handlers.retain(|_, bucket| {
                    bucket.retain(|entry| entry.id != id);
                    !bucket.is_empty()
                });
            }
        }
        self.cache.clear();
    }

    /// Every handler of this subtree matching `(event, channel)`.
    ///
    /// Candidates are this manager's name-wildcard bucket plus its bucket
    /// for the event's name, channel-filtered; globals are added unless
    /// excluded; children are searched recursively. A `Target` query is
    /// delegated to the target component and never escapes its subtree.
    pub(crate) fn collect_handlers(
        &self,
        event: &Event,
        channel: &Channel,
        exclude_globals: bool,
    ) -> Vec<Arc<HandlerEntry>> {
        if let Channel::Target(target) = channel {
            if *target != self.id {
                return match self.find(*target) {
                    Some(component) => {
                        component.collect_handlers(event, channel, exclude_globals)
                    }
                    None => Vec::new(),
                };
            }
        }
        let directed = matches!(channel, Channel::Target(_));

        let mut out = Vec::new();
        for bucket in [self.handlers.get("*"), self.handlers.get(event.name())]
            .into_iter()
            .flatten()
        {
            for entry in bucket {
                if entry.matches(channel) {
                    out.push(entry.clone());
                }
            }
        }

        if !exclude_globals {
            out.extend(self.globals.iter().cloned());
        }

        if !directed {
            for component in &self.components {
                out.extend(component.collect_handlers(event, channel, exclude_globals));
            }
        }

        out
    }

    /// Cache-bypassed resolution: the deduplicated, `(priority, filter)`
    /// ordered handler ids for an event fired on `channels`.
    pub fn matching_handlers(&self, event: &Event, channels: &[Channel]) -> Vec<HandlerId> {
        let mut seen = HashSet::new();
        let mut list = Vec::new();
        for channel in channels {
            for entry in self.collect_handlers(event, channel, false) {
                if seen.insert(entry.id) {
                    list.push(entry);
                }
            }
        }
        sort_handlers(&mut list);
        list.into_iter().map(|entry| entry.id).collect()
    }

    /// Resolves the ordered handler list for a dispatch, consulting the
    /// cache first.
    pub(crate) fn resolve(&mut self, event: &Event, channels: &[Channel]) -> Arc<[Arc<HandlerEntry>]> {
        let key: CacheKey = (event.name().to_owned(), channels.to_vec());
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }

        let mut seen = HashSet::new();
        let mut list = Vec::new();
        for channel in channels {
            for entry in self.collect_handlers(event, channel, false) {
                if seen.insert(entry.id) {
                    list.push(entry);
                }
            }
        }
        sort_handlers(&mut list);

        let resolved: Arc<[Arc<HandlerEntry>]> = list.into();
        self.cache.insert(key, resolved.clone());
        resolved
    }
}

/// Higher priority first; among equal priorities, filters first.
pub(crate) fn sort_handlers(list: &mut [Arc<HandlerEntry>]) {
    list.sort_by(|a, b| {
        b.priority
            .total_cmp(&a.priority)
            .then(b.filter.cmp(&a.filter))
    });
}

// Component tree.
impl Manager {
    /// Registers `child` as a direct component of this manager, splicing its
    /// queued events into this tree's root queue. Invalidates the cache.
    pub fn register(&mut self, child: Manager) -> ComponentId {
        let id = child.id;
        {
            let mut child_queue = child.queue.lock();
            let mut queue = self.queue.lock();
            queue.extend(child_queue.drain(..));
        }
        info!("REGISTER {} ({}) UNDER {} ({})", child.name, id, self.name, self.id);
        self.components.push(child);
        self.cache.clear();
        id
    }

    /// Registers `child` under the component identified by `parent`,
    /// anywhere in this tree. Hands the child back if `parent` is unknown.
    pub fn register_to(&mut self, parent: ComponentId, child: Manager) -> Result<ComponentId, Manager> {
        if self.find(parent).is_none() {
            return Err(child);
        }
        let id = child.id;
        {
            let mut child_queue = child.queue.lock();
            let mut queue = self.queue.lock();
            queue.extend(child_queue.drain(..));
        }
        info!("REGISTER {} ({}) UNDER {}", child.name, id, parent);
        let node = self.find_mut(parent).expect("parent verified above");
        node.components.push(child);
        self.cache.clear();
        Ok(id)
    }

    /// Detaches a component (and its subtree), returning it. The detached
    /// manager is its own root again. Unknown ids are tolerated.
    pub fn unregister(&mut self, id: ComponentId) -> Option<Manager> {
        if id == self.id {
            return None;
        }
        let removed = self.take_component(id);
        match &removed {
            Some(component) => {
                info!("UNREGISTER {} ({})", component.name, id);
                self.cache.clear();
            }
            None => warn!("UNREGISTER unknown component {id}; ignoring"),
        }
        removed
    }

    fn take_component(&mut self, id: ComponentId) -> Option<Manager> {
        if let Some(position) = self.components.iter().position(|c| c.id == id) {
            return Some(self.components.remove(position));
        }
        for component in &mut self.components {
            if let Some(found) = component.take_component(id) {
                return Some(found);
            }
        }
        None
    }

    /// Finds a component of this subtree by id.
    pub fn find(&self, id: ComponentId) -> Option<&Manager> {
        if self.id == id {
            return Some(self);
        }
        for component in &self.components {
            if let Some(found) = component.find(id) {
                return Some(found);
            }
        }
        None
    }

    pub(crate) fn find_mut(&mut self, id: ComponentId) -> Option<&mut Manager> {
        if self.id == id {
            return Some(self);
        }
        for component in &mut self.components {
            if let Some(found) = component.find_mut(id) {
                return Some(found);
            }
        }
        None
    }
}

/// Channel resolution at fire time: explicit channels win, then the event's
/// preset channels, then the firing component's channel, then `Any`.
pub(crate) fn resolve_channels(
    event: &Event,
    explicit: &[Channel],
    fallback: Option<&Channel>,
) -> Vec<Channel> {
    if !explicit.is_empty() {
        explicit.to_vec()
    } else if !event.preset_channels().is_empty() {
        event.preset_channels().to_vec()
    } else if let Some(channel) = fallback {
        vec![channel.clone()]
    } else {
        vec![Channel::Any]
    }
}

// Fire path.
impl Manager {
    /// Fires an event, resolving channels from the event or this component.
    /// Returns the attached promise.
    pub fn fire(&mut self, event: Event) -> Value {
        let fallback = self.channel.clone();
        self.fire_with(event, &[], fallback.as_ref())
    }

    /// Fires an event on explicit channels. Returns the attached promise.
    pub fn fire_to(&mut self, event: Event, channels: &[Channel]) -> Value {
        let fallback = self.channel.clone();
        self.fire_with(event, channels, fallback.as_ref())
    }

    pub(crate) fn fire_with(
        &mut self,
        event: Event,
        explicit: &[Channel],
        fallback: Option<&Channel>,
    ) -> Value {
        let channels = resolve_channels(&event, explicit, fallback);
        let value = Value::new(event.wants_notify());
        let event = Arc::new(event);
        {
            let mut state = event.state();
            state.channels = channels.clone();
            state.value = Some(value.clone());
        }
        self.enqueue(event, channels);
        value
    }

    /// Appends a fired event to the queue, linking it into the cause chain
    /// of the event currently dispatching (same-thread fires only; signal
    /// events are exempt), and wakes a sleeping root.
    pub(crate) fn enqueue(&mut self, event: Arc<Event>, channels: Vec<Channel>) {
        if !event.is_silent() {
            debug!("FIRE {:?} -> {:?}", event, channels);
        }

        if self.executing_thread == Some(std::thread::current().id())
            && event.name() != names::SIGNAL
        {
            if let Some(current) = &self.currently_handling {
                let mut current_state = current.state();
                if current_state.cause.is_some() {
                    current_state.effects += 1;
                    drop(current_state);
                    let mut state = event.state();
                    state.cause = Some(current.clone());
                    state.effects = 1;
                }
            }
        }

        self.queue.lock().push_back((event, channels));

        let wake = self.resume.lock().clone();
        if let Some(wake) = wake {
            wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Handler {
        Handler::new(name, |_ctx, _event| Ok(Outcome::Pass))
    }

    #[test]
    fn classification_of_handler_buckets() {
        let mut mgr = Manager::new("root");

        mgr.add_handler(noop("ping"));
        mgr.add_handler(Handler::wildcard(|_ctx, _event| Ok(Outcome::Pass)).channel("*"));
        mgr.add_handler(Handler::wildcard(|_ctx, _event| Ok(Outcome::Pass)).channel("web"));

        assert_eq!(mgr.handlers.get("ping").map(Vec::len), Some(1));
        assert_eq!(mgr.globals.len(), 1);
        assert_eq!(mgr.handlers.get("*").map(Vec::len), Some(1));
    }

    #[test]
    fn inherited_channel_comes_from_the_component() {
        let mut svc = Manager::new("svc").with_channel("svc");
        svc.add_handler(noop("job"));

        let event = Event::new("job");
        assert_eq!(
            svc.collect_handlers(&event, &Channel::Name("svc".into()), false)
                .len(),
            1
        );
        assert!(svc
            .collect_handlers(&event, &Channel::Name("other".into()), false)
            .is_empty());
    }

    #[test]
    fn removal_is_idempotent_and_prunes_buckets() {
        let mut mgr = Manager::new("root");
        let id = mgr.add_handler(noop("ping"));

        mgr.remove_handler(id, Some("ping"));
        assert!(mgr.handlers.get("ping").is_none());

        // unknown handler and unknown bucket are tolerated
        mgr.remove_handler(id, Some("ping"));
        mgr.remove_handler(id, None);
    }

    #[test]
    fn resolution_is_cached_and_invalidated() {
        let mut mgr = Manager::new("root");
        mgr.add_handler(noop("ping"));

        let event = Event::new("ping");
        let channels = vec![Channel::Any];
        let first = mgr.resolve(&event, &channels);
        assert_eq!(first.len(), 1);
        assert_eq!(mgr.cache.len(), 1);

        mgr.add_handler(noop("ping"));
        assert!(mgr.cache.is_empty());
        let second = mgr.resolve(&event, &channels);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn directed_queries_stay_inside_the_target() {
        let mut root = Manager::new("root");
        root.add_handler(noop("job"));

        let mut svc = Manager::new("svc");
        svc.add_handler(noop("job"));
        let mut inner = Manager::new("inner");
        inner.add_handler(noop("job"));
        svc.register(inner);
        let svc_id = root.register(svc);

        let event = Event::new("job");
        let directed = root.collect_handlers(&event, &Channel::Target(svc_id), false);
        // the target's own handlers only; not the root's, not the subtree's
        assert_eq!(directed.len(), 1);
    }

    #[test]
    fn register_splices_queued_events_into_the_root() {
        let mut child = Manager::new("child");
        child.fire(Event::new("early"));
        assert_eq!(child.queued(), 1);

        let mut root = Manager::new("root");
        root.register(child);
        assert_eq!(root.queued(), 1);
    }

    #[test]
    fn ordering_is_priority_then_filter() {
        let mut list = vec![
            Arc::new(HandlerEntry {
                id: HandlerId::next(),
                names: vec!["x".into()],
                channel: None,
                priority: 0.0,
                filter: false,
                owner: ComponentId::next(),
                owner_channel: None,
                func: Mutex::new(Box::new(|_ctx: &mut Ctx<'_>, _event: &Arc<Event>| Ok(Outcome::Pass)) as HandlerFn),
            }),
            Arc::new(HandlerEntry {
                id: HandlerId::next(),
                names: vec!["x".into()],
                channel: None,
                priority: 0.0,
                filter: true,
                owner: ComponentId::next(),
                owner_channel: None,
                func: Mutex::new(Box::new(|_ctx: &mut Ctx<'_>, _event: &Arc<Event>| Ok(Outcome::Pass)) as HandlerFn),
            }),
            Arc::new(HandlerEntry {
                id: HandlerId::next(),
                names: vec!["x".into()],
                channel: None,
                priority: 5.0,
                filter: false,
                owner: ComponentId::next(),
                owner_channel: None,
                func: Mutex::new(Box::new(|_ctx: &mut Ctx<'_>, _event: &Arc<Event>| Ok(Outcome::Pass)) as HandlerFn),
            }),
        ];

        sort_handlers(&mut list);
        assert_eq!(list[0].priority, 5.0);
        assert!(list[1].filter);
        assert!(!list[2].filter);
    }
}
