//! Per entity type serialization of resolve-or-create
//!
//! Two concurrent callers must not both decide "no match" for the same new
//! name. Resolution is coarse-grained: one async mutex per entity type tag.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::tags::EntityType;

#[derive(Debug, Default, Clone)]
pub struct TypeLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl TypeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, entity_type: &EntityType) -> Arc<AsyncMutex<()>> {
        let mut map = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(entity_type.as_str().to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Hold the guard for the whole read-decide-write cycle
    pub async fn acquire(&self, entity_type: &EntityType) -> OwnedMutexGuard<()> {
        self.lock_for(entity_type).lock_owned().await
    }
}
