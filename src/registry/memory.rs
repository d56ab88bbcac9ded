//! In-memory registry and agreement store

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::{DeviceIdentity, DeviceRecord, JoinNonceState, KeyRegistry, RoamingAgreements};
use crate::error::RegistryError;
use crate::lorawan::{Eui64, NetId};

/// Device store held in process memory.
///
/// `commit_join` takes the write lock for its compare-and-swap, so commits
/// for one device are serialized while lookups proceed concurrently.
#[derive(Debug)]
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<DeviceIdentity, DeviceRecord>>,
    available: AtomicBool,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::from_records(Vec::new())
    }

    pub fn from_records(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let devices = records
            .into_iter()
            .map(|record| (record.identity, record))
            .collect();
        Self {
            devices: RwLock::new(devices),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a backend outage: while unavailable every call fails with
    /// [`RegistryError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn nonce_state(&self, identity: &DeviceIdentity) -> Option<JoinNonceState> {
        self.devices
            .read()
            .await
            .get(identity)
            .map(|record| record.nonce_state)
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    fn ensure_available(&self) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable("in-memory registry offline".into()))
        }
    }
}

#[async_trait]
impl KeyRegistry for InMemoryRegistry {
    async fn lookup(&self, identity: &DeviceIdentity) -> Result<DeviceRecord, RegistryError> {
        self.ensure_available()?;
        self.devices
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or(RegistryError::DeviceUnknown)
    }

    async fn commit_join(
        &self,
        identity: &DeviceIdentity,
        next: JoinNonceState,
        expected: &JoinNonceState,
    ) -> Result<(), RegistryError> {
        self.ensure_available()?;
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(identity)
            .ok_or(RegistryError::DeviceUnknown)?;

        if record.nonce_state != *expected {
            debug!(
                "Commit conflict for {}: expected {:?}, found {:?}",
                identity, expected, record.nonce_state
            );
            return Err(RegistryError::Conflict);
        }

        record.nonce_state = next;
        record.last_joined_at = Some(chrono::Utc::now());
        Ok(())
    }
}

/// Agreements loaded from configuration: NetID → JoinEUIs it may join.
#[derive(Debug, Default, Clone)]
pub struct StaticAgreements {
    agreements: HashMap<NetId, HashSet<Eui64>>,
}

impl StaticAgreements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, net_id: NetId, join_eui: Eui64) -> Self {
        self.agreements.entry(net_id).or_default().insert(join_eui);
        self
    }
}

#[async_trait]
impl RoamingAgreements for StaticAgreements {
    async fn has_agreement(&self, join_eui: Eui64, net_id: NetId) -> Result<bool, RegistryError> {
        Ok(self
            .agreements
            .get(&net_id)
            .is_some_and(|euis| euis.contains(&join_eui)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::keys::{AesKey, RootKeySet};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(Eui64::from_u64(1), Eui64::from_u64(2))
    }

    fn registry() -> InMemoryRegistry {
        InMemoryRegistry::from_records([DeviceRecord::new(
            identity(),
            RootKeySet {
                nwk_key: AesKey::new([0x11; 16]),
                app_key: None,
            },
        )])
    }

    #[tokio::test]
    async fn test_lookup_unknown_device() {
        let reg = registry();
        assert_eq!(reg.device_count().await, 1);
        let other = DeviceIdentity::new(Eui64::from_u64(1), Eui64::from_u64(3));
        assert_eq!(
            reg.lookup(&other).await.unwrap_err(),
            RegistryError::DeviceUnknown
        );
    }

    #[tokio::test]
    async fn test_commit_applies_when_state_matches() {
        let reg = registry();
        let before = reg.lookup(&identity()).await.unwrap();
        let next = JoinNonceState {
            last_join_nonce: 1,
            last_dev_nonce: Some(0),
        };

        tokio_test::assert_ok!(reg.commit_join(&identity(), next, &before.nonce_state).await);

        let after = reg.lookup(&identity()).await.unwrap();
        assert_eq!(after.nonce_state, next);
        assert!(after.last_joined_at.is_some());
    }

    #[tokio::test]
    async fn test_commit_conflict_leaves_state() {
        let reg = registry();
        let stale = JoinNonceState::default();
        let first = JoinNonceState {
            last_join_nonce: 1,
            last_dev_nonce: Some(5),
        };
        let second = JoinNonceState {
            last_join_nonce: 1,
            last_dev_nonce: Some(6),
        };

        reg.commit_join(&identity(), first, &stale).await.unwrap();
        assert_eq!(
            reg.commit_join(&identity(), second, &stale).await,
            Err(RegistryError::Conflict)
        );
        assert_eq!(reg.nonce_state(&identity()).await, Some(first));
    }

    #[tokio::test]
    async fn test_unavailable_registry() {
        let reg = registry();
        reg.set_available(false);
        assert!(matches!(
            reg.lookup(&identity()).await,
            Err(RegistryError::Unavailable(_))
        ));

        reg.set_available(true);
        tokio_test::assert_ok!(reg.lookup(&identity()).await);
    }

    #[tokio::test]
    async fn test_static_agreements() {
        let agreements = StaticAgreements::new().allow(NetId::new(0x13), Eui64::from_u64(1));

        assert!(agreements
            .has_agreement(Eui64::from_u64(1), NetId::new(0x13))
            .await
            .unwrap());
        assert!(!agreements
            .has_agreement(Eui64::from_u64(2), NetId::new(0x13))
            .await
            .unwrap());
        assert!(!agreements
            .has_agreement(Eui64::from_u64(1), NetId::new(0x14))
            .await
            .unwrap());
    }
}
