//! Event emitters and disposable registration handles.
//!
//! Every component exposes its notifications as [`Event`] handles. An `Event`
//! is a shared pointer to the listener list owned by an [`Emitter`], so any
//! number of clones (including the ones re-exported by the workspace facade)
//! observe exactly the same stream.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::util::lock;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

/// Subscription side of an [`Emitter`].
pub struct Event<T> {
    inner: Arc<Mutex<Listeners<T>>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("listeners", &lock(&self.inner).entries.len())
            .finish()
    }
}

impl<T: 'static> Event<T> {
    /// Register a listener. Listeners run synchronously, in subscription
    /// order, for every fired value.
    pub fn subscribe<F>(&self, listener: F) -> Disposable
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut listeners = lock(&self.inner);
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Listeners<T>>> = Arc::downgrade(&self.inner);
        Disposable::from_fn(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Forward every fired value into an unbounded channel.
    pub fn stream(&self) -> (mpsc::UnboundedReceiver<T>, Disposable)
    where
        T: Clone + Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let disposable = self.subscribe(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        (rx, disposable)
    }

    /// Whether both handles point at the same emitter.
    pub fn ptr_eq(a: &Event<T>, b: &Event<T>) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

/// Owning side of an event stream.
pub struct Emitter<T> {
    event: Event<T>,
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.event.fmt(f)
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            event: Event {
                inner: Arc::new(Mutex::new(Listeners {
                    next_id: 0,
                    entries: Vec::new(),
                })),
            },
        }
    }

    /// Handle to subscribe with. All handles alias the same listener list.
    pub fn event(&self) -> Event<T> {
        self.event.clone()
    }

    /// Deliver `value` to every current listener.
    ///
    /// The listener list is snapshotted first so listeners may subscribe,
    /// dispose, or fire other events without deadlocking.
    pub fn fire(&self, value: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.event.inner)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    /// Drop every listener.
    pub fn clear(&self) {
        lock(&self.event.inner).entries.clear();
    }
}

/// Release token returned by every registration.
///
/// Releasing is idempotent and dropping a `Disposable` does not release it.
pub struct Disposable {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Disposable {
    pub fn from_fn<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn noop() -> Self {
        Self::from_fn(|| {})
    }

    /// Combine several handles into one that releases them in order.
    pub fn all(disposables: Vec<Disposable>) -> Self {
        Self::from_fn(move || {
            for disposable in disposables {
                disposable.dispose();
            }
        })
    }

    pub fn dispose(&self) {
        let action = lock(&self.action).take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.action).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listeners_receive_values_in_order() {
        let emitter: Emitter<u32> = Emitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = emitter.event().subscribe(move |v| sink.lock().unwrap().push(*v));

        emitter.fire(&1);
        emitter.fire(&2);
        emitter.fire(&3);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dispose_is_idempotent_and_unsubscribes() {
        let emitter: Emitter<()> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let sub = emitter.event().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        emitter.fire(&());
        sub.dispose();
        sub.dispose();
        emitter.fire(&());

        assert!(sub.is_disposed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.event().listener_count(), 0);
    }

    #[test]
    fn test_event_handles_alias_the_emitter() {
        let emitter: Emitter<u8> = Emitter::new();
        let a = emitter.event();
        let b = emitter.event();
        let other: Emitter<u8> = Emitter::new();

        assert!(Event::ptr_eq(&a, &b));
        assert!(!Event::ptr_eq(&a, &other.event()));
    }

    #[test]
    fn test_listener_may_subscribe_while_firing() {
        let emitter: Arc<Emitter<u8>> = Arc::new(Emitter::new());
        let inner = emitter.clone();
        let _sub = emitter.event().subscribe(move |_| {
            let _nested = inner.event().subscribe(|_| {});
        });

        emitter.fire(&0);
        assert_eq!(emitter.event().listener_count(), 2);
    }

    #[tokio::test]
    async fn test_stream_forwards_values() {
        let emitter: Emitter<String> = Emitter::new();
        let (mut rx, _sub) = emitter.event().stream();

        emitter.fire(&"a".to_string());
        emitter.fire(&"b".to_string());

        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
    }
}
