//! The engine catalog: id → shared record.
//!
//! Structural mutations take the exclusive map lock, lookups the shared
//! one. Records are `Arc`-shared, so a handle observed before removal
//! stays valid until its last holder drops it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::record::EngineRecord;

#[derive(Default)]
pub struct EngineRegistry {
    map: RwLock<HashMap<String, Arc<EngineRecord>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, engine_id: &str) -> Option<Arc<EngineRecord>> {
        self.map.read().get(engine_id).cloned()
    }

    pub fn contains(&self, engine_id: &str) -> bool {
        self.map.read().contains_key(engine_id)
    }

    /// Insert a record unless the id is already taken. This is the
    /// double-check that makes concurrent adds of the same id safe: the
    /// caller pre-checked under the shared lock before doing its
    /// (lock-free) validation and load work.
    pub fn insert_if_absent(&self, record: Arc<EngineRecord>) -> Result<(), Arc<EngineRecord>> {
        let mut map = self.map.write();
        if map.contains_key(&record.id) {
            return Err(record);
        }
        map.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn remove(&self, engine_id: &str) -> Option<Arc<EngineRecord>> {
        self.map.write().remove(engine_id)
    }

    /// Handles to every record, for autoscaler passes and listings.
    pub fn snapshot(&self) -> Vec<Arc<EngineRecord>> {
        self.map.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
