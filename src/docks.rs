//! The docks — which crane is assigned to which hub.
//!
//! One crane at a time is assigned per hub; optimisation and the home-hub
//! logic consult the registry to decide whether a lane already exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::crane::Crane;
use crate::hub::HubId;

/// Registry of cranes assigned to hubs.
#[derive(Default)]
pub struct CraneRegistry {
    cranes: Mutex<HashMap<HubId, Arc<Crane>>>,
}

impl CraneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `crane` to `hub_id`, replacing any previous assignment.
    pub fn assign(&self, hub_id: HubId, crane: Arc<Crane>) {
        debug!(hub = %hub_id, "docks: crane assigned");
        self.cranes
            .lock()
            .expect("registry lock poisoned")
            .insert(hub_id, crane);
    }

    pub fn get(&self, hub_id: &HubId) -> Option<Arc<Crane>> {
        self.cranes
            .lock()
            .expect("registry lock poisoned")
            .get(hub_id)
            .cloned()
    }

    pub fn unassign(&self, hub_id: &HubId) -> Option<Arc<Crane>> {
        self.cranes
            .lock()
            .expect("registry lock poisoned")
            .remove(hub_id)
    }

    pub fn all(&self) -> Vec<Arc<Crane>> {
        self.cranes
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cranes.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every assignment whose crane has fully stopped.
    pub fn prune_stopped(&self) -> usize {
        let mut cranes = self.cranes.lock().expect("registry lock poisoned");
        let before = cranes.len();
        cranes.retain(|_, crane| !crane.is_stopped());
        before - cranes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crane::CraneOpts;
    use crate::hub::Hub;
    use crate::unit::Scheduler;

    fn test_crane(name: &str) -> Arc<Crane> {
        let (left, _right) = tokio::io::duplex(1024);
        Crane::new(
            Hub::new(name),
            Box::new(left),
            Scheduler::default(),
            CraneOpts::default(),
        )
    }

    #[tokio::test]
    async fn assign_get_unassign() {
        let registry = CraneRegistry::new();
        let crane = test_crane("h1");
        registry.assign(HubId::from("h1"), Arc::clone(&crane));

        assert!(registry.get(&HubId::from("h1")).is_some());
        assert!(registry.get(&HubId::from("h2")).is_none());
        assert_eq!(registry.len(), 1);

        registry.unassign(&HubId::from("h1"));
        assert!(registry.is_empty());
        crane.stop(None);
    }

    #[tokio::test]
    async fn prune_drops_only_stopped_cranes() {
        let registry = CraneRegistry::new();
        let alive = test_crane("alive");
        let dead = test_crane("dead");
        registry.assign(HubId::from("alive"), Arc::clone(&alive));
        registry.assign(HubId::from("dead"), Arc::clone(&dead));

        dead.stop(None);
        assert_eq!(registry.prune_stopped(), 1);
        assert!(registry.get(&HubId::from("alive")).is_some());
        assert!(registry.get(&HubId::from("dead")).is_none());
        alive.stop(None);
    }
}
