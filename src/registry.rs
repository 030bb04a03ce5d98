//! An explicit, application-owned registry of coalescers, one per
//! [`BatchKey`].

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::{
    batch::{BatchFuture, BatchRules, Coalescer},
    data::BatchKey,
    error::RegistryError,
    window::Window,
};

/// A type-erased handler, so that coalescers with different handler
/// closures can live in the same registry.
pub type BoxedHandler<Param, Value, Error> =
    Box<dyn Fn(Vec<Param>) -> BoxFuture<'static, Result<Vec<Value>, Error>> + Send + Sync>;

/// Erase the type of a handler. See [`DynRegistry`].
pub fn boxed_handler<Param, Value, Error, Handler, Fut>(
    handler: Handler,
) -> BoxedHandler<Param, Value, Error>
where
    Param: 'static,
    Value: 'static,
    Error: 'static,
    Handler: Fn(Vec<Param>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Value>, Error>> + Send + 'static,
{
    Box::new(move |params| handler(params).boxed())
}

/// A registry of boxed handlers using [`Duration`] windows, which is what
/// most applications want.
pub type DynRegistry<Param, Value, Error> = CoalescerRegistry<
    Param,
    Value,
    Error,
    BoxFuture<'static, Result<Vec<Value>, Error>>,
    BoxedHandler<Param, Value, Error>,
    Duration,
>;

type CoalescerMap<Param, Value, Error, Fut, Handler, W> =
    HashMap<BatchKey, Arc<Coalescer<Param, Value, Error, Fut, Handler, W>>>;

/// Maps each [`BatchKey`] to its [`Coalescer`]. Every key has its own
/// windows, timers and handler; nothing is shared between keys.
///
/// Lookups read a snapshot of the map without locking. Registration and
/// removal copy the map, so they are comparatively slow and meant to happen
/// while an application is starting up.
pub struct CoalescerRegistry<Param, Value, Error, Fut, Handler, W: Window> {
    coalescers: ArcSwap<CoalescerMap<Param, Value, Error, Fut, Handler, W>>,
}

impl<Param, Value, Error, Fut, Handler, W: Window> Default
    for CoalescerRegistry<Param, Value, Error, Fut, Handler, W>
{
    fn default() -> Self {
        Self {
            coalescers: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl<Param, Value, Error, Fut, Handler, W: Window> Debug
    for CoalescerRegistry<Param, Value, Error, Fut, Handler, W>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescerRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl<Param, Value, Error, Fut, Handler, W: Window>
    CoalescerRegistry<Param, Value, Error, Fut, Handler, W>
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a coalescer for `key`. Fails if `key` already has
    /// one; the existing coalescer is left in place.
    pub fn register(
        &self,
        key: impl Into<BatchKey>,
        rules: BatchRules<Handler, W>,
    ) -> Result<Arc<Coalescer<Param, Value, Error, Fut, Handler, W>>, RegistryError> {
        let key = key.into();
        let coalescer = Arc::new(Coalescer::new(key.clone(), rules));

        // rcu may call this more than once if it races with another update;
        // `inserted` reflects the attempt that actually got stored.
        let mut inserted = false;
        self.coalescers.rcu(|current| {
            if current.contains_key(&key) {
                inserted = false;
                Arc::clone(current)
            } else {
                inserted = true;
                let mut next = HashMap::clone(current);
                next.insert(key.clone(), Arc::clone(&coalescer));
                Arc::new(next)
            }
        });

        if inserted {
            debug!(key = %key, max_size = coalescer.max_size().get(), "coalescer registered");
            Ok(coalescer)
        } else {
            Err(RegistryError::DuplicateKey(key))
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Coalescer<Param, Value, Error, Fut, Handler, W>>> {
        self.coalescers.load().get(key).cloned()
    }

    /// Remove the coalescer for `key`. Futures it already handed out are
    /// unaffected and still complete.
    pub fn remove(
        &self,
        key: &str,
    ) -> Option<Arc<Coalescer<Param, Value, Error, Fut, Handler, W>>> {
        let mut removed = None;
        self.coalescers.rcu(|current| {
            removed = current.get(key).cloned();
            if removed.is_some() {
                let mut next = HashMap::clone(current);
                next.remove(key);
                Arc::new(next)
            } else {
                Arc::clone(current)
            }
        });

        if removed.is_some() {
            debug!(key = %key, "coalescer removed");
        }
        removed
    }

    /// All registered keys, in sorted order.
    pub fn keys(&self) -> Vec<BatchKey> {
        let mut keys: Vec<BatchKey> = self.coalescers.load().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.coalescers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coalescers.load().is_empty()
    }
}

impl<Param, Value, Error, Fut, Handler, W> CoalescerRegistry<Param, Value, Error, Fut, Handler, W>
where
    Error: Clone,
    W: Window,
    Handler: Fn(Vec<Param>) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, Error>>,
{
    /// Fetch a single param through the coalescer registered for `key`.
    pub fn fetch(
        &self,
        key: &str,
        param: Param,
    ) -> Result<BatchFuture<Param, Value, Error, Fut, Handler, W::Delay>, RegistryError> {
        match self.coalescers.load().get(key) {
            Some(coalescer) => Ok(coalescer.fetch(param)),
            None => Err(RegistryError::UnknownKey(BatchKey::from(key))),
        }
    }
}
