use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A set of callbacks keyed by an opaque, monotonically increasing token.
///
/// Delivery walks a snapshot of the set taken at the start of [`emit`], so a
/// callback may attach or detach (itself or any other listener) while a
/// delivery pass is running. A listener detached mid-pass is skipped for the
/// remainder of that pass; everyone else keeps their registration order.
///
/// [`emit`]: Listeners::emit
pub struct Listeners<T: ?Sized> {
    inner: Arc<ListenerSet<T>>,
}

struct ListenerSet<T: ?Sized> {
    next_token: AtomicU64,
    entries: Mutex<BTreeMap<u64, Callback<T>>>,
}

trait Detach: Send + Sync {
    fn detach(&self, token: u64) -> bool;
}

impl<T: ?Sized + 'static> Detach for ListenerSet<T> {
    fn detach(&self, token: u64) -> bool {
        lock(&self.entries).remove(&token).is_some()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: ?Sized + 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenerSet {
                next_token: AtomicU64::new(0),
                entries: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn attach<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.inner.entries).insert(token, Arc::new(callback));
        let owner: Arc<dyn Detach> = self.inner.clone();
        Subscription {
            token,
            owner: Some(Arc::downgrade(&owner)),
        }
    }

    pub fn emit(&self, value: &T) {
        let snapshot: Vec<(u64, Callback<T>)> = lock(&self.inner.entries)
            .iter()
            .map(|(token, callback)| (*token, callback.clone()))
            .collect();
        for (token, callback) in snapshot {
            if !lock(&self.inner.entries).contains_key(&token) {
                continue;
            }
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registration. Outstanding [`Subscription`]s become inert.
    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }
}

impl<T: ?Sized + 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").finish_non_exhaustive()
    }
}

/// Detach handle returned by [`Listeners::attach`]. Dropping it detaches the
/// callback; detaching twice, or after the listener set is gone, is a no-op.
#[must_use = "dropping a Subscription detaches its callback immediately"]
pub struct Subscription {
    token: u64,
    owner: Option<Weak<dyn Detach>>,
}

impl Subscription {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Returns `true` when this call removed a live registration.
    pub fn detach(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        match self.owner.take().and_then(|owner| owner.upgrade()) {
            Some(owner) => owner.detach(self.token),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.token)
            .finish()
    }
}
