use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Inner<T> {
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
}

/// An ordered list of change subscribers.
///
/// Subscribers are called synchronously, in subscription order, on the thread
/// that calls [`Observable::notify`]. The list is snapshotted before calling
/// out, so a subscriber may subscribe or unsubscribe without deadlocking.
pub struct Observable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                subscribers: vec![],
            })),
        }
    }
}

impl<T: 'static> Observable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, Arc::new(callback)));
        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().subscribers.retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    pub fn notify(&self, event: &T) {
        let subscribers: Vec<Callback<T>> = self
            .inner
            .lock()
            .subscribers
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in subscribers {
            cb(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Disposer returned by [`Observable::subscribe`]. The subscription ends when
/// this is dropped or [`Subscription::unsubscribe`] is called.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}
