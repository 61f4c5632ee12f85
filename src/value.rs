//! Values: promise-like result containers attached to every fired event.
use crate::*;
use futures::channel::oneshot;

/// The settled snapshot delivered to [`Value::subscribe`] receivers.
#[derive(Debug, Clone)]
pub struct Settled {
    /// The final value: the last non-null handler or task return.
    pub value: Option<Arc<dyn Payload>>,
    /// Whether any handler or task failed along the way.
    pub errors: bool,
}

struct ValueInner {
    value: Option<Arc<dyn Payload>>,
    errors: bool,
    promise: bool,
    notify: bool,
    settled: bool,
    subscribers: Vec<oneshot::Sender<Settled>>,
}

/// The result container attached to every fired event.
///
/// Cheap to clone and safe to hold from any thread. The last non-null
/// handler return wins; `errors` is sticky once set.
#[derive(Clone)]
pub struct Value {
    inner: Arc<Mutex<ValueInner>>,
}

impl Value {
    pub(crate) fn new(notify: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ValueInner {
                value: None,
                errors: false,
                promise: false,
                notify,
                settled: false,
                subscribers: Vec::new(),
            })),
        }
    }

    /// The current value, if any handler produced one yet.
    pub fn get(&self) -> Option<Arc<dyn Payload>> {
        self.inner.lock().value.clone()
    }

    /// Whether any handler or task failed. Sticky.
    pub fn errors(&self) -> bool {
        self.inner.lock().errors
    }

    /// Whether a handler suspended; the final value arrives via a task.
    pub fn promise(&self) -> bool {
        self.inner.lock().promise
    }

    /// Whether the owning event requested value notification.
    pub fn notify(&self) -> bool {
        self.inner.lock().notify
    }

    /// Subscribes for the settled snapshot; fulfilled by `inform(true)`.
    ///
    /// Subscribing after settlement yields the snapshot immediately.
    pub fn subscribe(&self) -> oneshot::Receiver<Settled> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.settled {
            let _ = tx.send(Settled {
                value: inner.value.clone(),
                errors: inner.errors,
            });
        } else {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Overwrites the value. The last non-null assignment wins.
    pub(crate) fn set(&self, value: Arc<dyn Payload>) {
        self.inner.lock().value = Some(value);
    }

    /// Marks the value as errored. Never cleared.
    pub(crate) fn poison(&self) {
        self.inner.lock().errors = true;
    }

    pub(crate) fn set_promise(&self) {
        self.inner.lock().promise = true;
    }

    /// Declares the result final, fulfilling subscribers. Idempotent.
    pub(crate) fn inform(&self, complete: bool) {
        if !complete {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.settled {
            return;
        }
        inner.settled = true;
        let snapshot = Settled {
            value: inner.value.clone(),
            errors: inner.errors,
        };
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(snapshot.clone());
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.inner.lock();
        fmt.debug_struct("Value")
            .field("value", &inner.value)
            .field("errors", &inner.errors)
            .field("promise", &inner.promise)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_and_errors_stick() {
        let value = Value::new(false);
        value.set(Arc::new(1u32));
        value.set(Arc::new(2u32));
        assert_eq!(
            value.get().and_then(|v| v.downcast_ref::<u32>().copied()),
            Some(2)
        );

        value.poison();
        assert!(value.errors());
        value.set(Arc::new(3u32));
        assert!(value.errors());
    }

    #[test]
    fn subscribers_get_the_settled_snapshot() {
        let value = Value::new(false);
        let mut early = value.subscribe();
        assert!(matches!(early.try_recv(), Ok(None)));

        value.set(Arc::new("done"));
        value.inform(false);
        assert!(matches!(early.try_recv(), Ok(None)));

        value.inform(true);
        let snapshot = early.try_recv().unwrap().unwrap();
        assert!(!snapshot.errors);

        // late subscription settles immediately
        let mut late = value.subscribe();
        assert!(late.try_recv().unwrap().is_some());
    }
}
