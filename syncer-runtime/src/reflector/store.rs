//! The reader/writer halves of a reflector cache.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::sync::watch;

use syncer_core::SyncedObject;

use super::ObjectKey;
use crate::watcher::Event;

type Shared<K> = Arc<RwLock<AHashMap<ObjectKey, Arc<K>>>>;

/// The writable half of a cache. Exclusive: exactly one reflector feeds it.
#[derive(Debug)]
pub struct Writer<K> {
    store: Shared<K>,
    ready_tx: watch::Sender<bool>,
}

impl<K: SyncedObject> Default for Writer<K> {
    fn default() -> Self {
        let (ready_tx, _) = watch::channel(false);
        Writer {
            store: Arc::default(),
            ready_tx,
        }
    }
}

impl<K: SyncedObject> Writer<K> {
    /// A read handle onto the same cache; cheap to clone further.
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: Arc::clone(&self.store),
            ready: self.ready_tx.subscribe(),
        }
    }

    /// Apply one watch event to the cache. A `Restarted` event replaces the
    /// whole cache content and flips the synced signal.
    pub fn apply(&mut self, event: &Event<K>) {
        match event {
            Event::Applied(obj) => {
                self.store
                    .write()
                    .insert(ObjectKey::from_obj(obj), Arc::new(obj.clone()));
            }
            Event::Deleted(obj) => {
                self.store.write().remove(&ObjectKey::from_obj(obj));
            }
            Event::Restarted(objs) => {
                let fresh: AHashMap<ObjectKey, Arc<K>> = objs
                    .iter()
                    .map(|obj| (ObjectKey::from_obj(obj), Arc::new(obj.clone())))
                    .collect();
                *self.store.write() = fresh;
                self.ready_tx.send_replace(true);
            }
        }
    }
}

/// A readable cache of the last observed state of one (cluster, kind).
///
/// The cache lags the cluster; consumers must treat content as a snapshot
/// and re-read after conditional-write conflicts.
#[derive(Clone, Debug)]
pub struct Store<K> {
    store: Shared<K>,
    ready: watch::Receiver<bool>,
}

impl<K: SyncedObject> Store<K> {
    /// The cached object under `key`, if any.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.read().get(key).cloned()
    }

    /// A snapshot of every cached object.
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Whether the initial list has landed.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Block until the initial list has landed. Returns `false` if the
    /// writer went away before the cache ever synced.
    pub async fn wait_until_ready(&self) -> bool {
        let mut ready = self.ready.clone();
        loop {
            if *ready.borrow() {
                return true;
            }
            if ready.changed().await.is_err() {
                return *ready.borrow();
            }
        }
    }
}
