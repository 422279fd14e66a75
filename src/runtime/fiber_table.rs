//! Registry of live fibers.

use crate::fiber::cell::FiberCell;
use crate::types::FiberId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Fibers that have started and not yet published an exit.
#[derive(Default)]
pub(crate) struct FiberTable {
    fibers: Mutex<HashMap<FiberId, Arc<FiberCell>>>,
}

impl FiberTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, fiber: Arc<FiberCell>) {
        self.fibers.lock().insert(fiber.id(), fiber);
    }

    pub(crate) fn remove(&self, id: FiberId) -> Option<Arc<FiberCell>> {
        self.fibers.lock().remove(&id)
    }

    pub(crate) fn get(&self, id: FiberId) -> Option<Arc<FiberCell>> {
        self.fibers.lock().get(&id).cloned()
    }

    pub(crate) fn contains(&self, id: FiberId) -> bool {
        self.fibers.lock().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.fibers.lock().len()
    }

    /// Ids of all live fibers, in creation order.
    pub(crate) fn ids(&self) -> Vec<FiberId> {
        let mut ids: Vec<FiberId> = self.fibers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Removes and returns every live fiber.
    pub(crate) fn drain(&self) -> Vec<Arc<FiberCell>> {
        self.fibers.lock().drain().map(|(_, fiber)| fiber).collect()
    }
}
