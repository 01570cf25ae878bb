use crate::config::ConfigSource;
use crate::store::{SqlStore, StoreBuilder};
use sqlfarm_core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Stores shared by config, for callers that would otherwise build a new
/// store per request. Entries are never evicted.
pub struct StoreCache {
    builder: StoreBuilder,
    stores: Mutex<HashMap<String, Arc<SqlStore>>>,
}

impl StoreCache {
    pub fn new(builder: StoreBuilder) -> Self {
        Self {
            builder,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// The store for `source`, built on first use. Whatever a previous user
    /// left uncommitted is rolled back before the store is handed out.
    pub fn get_or_create(&self, source: &ConfigSource, use_cache: bool) -> Result<Arc<SqlStore>> {
        let store = if use_cache {
            let key = source.cache_key()?;
            let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
            match stores.get(&key) {
                Some(store) => store.clone(),
                None => {
                    debug!(key = %key, "building cached store");
                    let store = Arc::new(self.builder.build_from(source)?);
                    stores.insert(key, store.clone());
                    store
                }
            }
        } else {
            Arc::new(self.builder.build_from(source)?)
        };
        store.rollback_all(false);
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.stores.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.stores.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
