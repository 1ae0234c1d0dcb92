// ABOUTME: Registry of configured connections, looked up by case-insensitive id
// ABOUTME: Read-mostly; readers take cheap snapshots of the Arc list

use super::Gateway;
use crate::error::{SmsError, SmsResult};
use std::sync::{Arc, PoisonError, RwLock};

/// All connections known to a service, in registration order
#[derive(Debug, Default)]
pub struct Registry {
    gateways: RwLock<Vec<Arc<Gateway>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; duplicate ids are rejected
    pub fn add(&self, gateway: Arc<Gateway>) -> SmsResult<()> {
        let mut gateways = self.gateways.write().unwrap_or_else(PoisonError::into_inner);
        if gateways.iter().any(|g| g.id() == gateway.id()) {
            return Err(SmsError::Config(format!(
                "duplicate gateway id {}",
                gateway.id()
            )));
        }
        gateways.push(gateway);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Gateway>> {
        self.gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|g| g.id().matches(id))
            .cloned()
    }

    /// Point-in-time copy of the connection list
    pub fn snapshot(&self) -> Vec<Arc<Gateway>> {
        self.gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;

    #[test]
    fn lookup_ignores_case_and_rejects_duplicates() {
        let registry = Registry::new();
        registry
            .add(Arc::new(Gateway::new("Modem1", LoopbackTransport::new())))
            .unwrap();

        assert!(registry.get("MODEM1").is_some());
        assert!(registry.get("modem2").is_none());

        let duplicate = Arc::new(Gateway::new("modem1", LoopbackTransport::new()));
        assert!(matches!(registry.add(duplicate), Err(SmsError::Config(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_keeps_registration_order() {
        let registry = Registry::new();
        for id in ["c", "a", "b"] {
            registry
                .add(Arc::new(Gateway::new(id, LoopbackTransport::new())))
                .unwrap();
        }
        let ids: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|g| g.id().to_string())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
