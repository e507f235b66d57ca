use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{info, warn};

use shep_store::Store;

use crate::LifecycleState;

/// Single current lifecycle state per domain, cached in memory and persisted
/// on every update. Updates are unconditional; validation against the
/// transition table happens in the status monitor, not here.
pub struct StateMachine {
    store: Arc<Store>,
    domain: String,
    current: RwLock<LifecycleState>,
}

impl StateMachine {
    /// Load the persisted state for `domain`, falling back to
    /// `Disconnected`. An unparseable persisted value is logged and treated
    /// the same way.
    pub fn new(store: Arc<Store>, domain: &str) -> Result<Self> {
        let current = match store.get_state(domain)? {
            Some(raw) => match LifecycleState::from_str(&raw) {
                Some(state) => state,
                None => {
                    warn!(domain, state = %raw, "Ignoring unrecognized persisted state");
                    LifecycleState::Disconnected
                }
            },
            None => LifecycleState::Disconnected,
        };
        Ok(Self {
            store,
            domain: domain.to_string(),
            current: RwLock::new(current),
        })
    }

    pub async fn get_state(&self) -> LifecycleState {
        *self.current.read().await
    }

    /// Set the state, persisting before the in-memory cache moves so a crash
    /// between the two re-reads the newer value.
    pub async fn update(&self, new: LifecycleState) -> Result<LifecycleState> {
        let mut current = self.current.write().await;
        let prev = *current;
        if prev != new {
            info!(domain = %self.domain, from = %prev, to = %new, "State change");
        }
        self.store.set_state(&self.domain, new.as_str())?;
        *current = new;
        Ok(prev)
    }

    /// Gate for database-query operations against the managed application.
    pub async fn is_query_safe(&self) -> bool {
        self.current.read().await.is_query_safe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_to_disconnected() {
        let store = Arc::new(Store::in_memory().unwrap());
        let sm = StateMachine::new(store, "default").unwrap();
        assert_eq!(sm.get_state().await, LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn test_update_persists() {
        let store = Arc::new(Store::in_memory().unwrap());
        let sm = StateMachine::new(Arc::clone(&store), "default").unwrap();
        let prev = sm.update(LifecycleState::Started).await.unwrap();
        assert_eq!(prev, LifecycleState::Disconnected);
        assert_eq!(
            store.get_state("default").unwrap().as_deref(),
            Some("STARTED")
        );

        // A second machine over the same store resumes from the persisted value.
        let sm2 = StateMachine::new(store, "default").unwrap();
        assert_eq!(sm2.get_state().await, LifecycleState::Started);
    }

    #[tokio::test]
    async fn test_unrecognized_persisted_state_falls_back() {
        let store = Arc::new(Store::in_memory().unwrap());
        store.set_state("default", "NOT-A-STATE").unwrap();
        let sm = StateMachine::new(store, "default").unwrap();
        assert_eq!(sm.get_state().await, LifecycleState::Disconnected);
    }
}
