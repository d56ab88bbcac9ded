//! Device/key registry and roaming agreement interfaces
//!
//! The join handler only reads root keys and nonce state through
//! [`KeyRegistry::lookup`], and records an accepted join through a single
//! compare-and-commit ([`KeyRegistry::commit_join`]). Storage is the
//! implementor's concern; [`memory`] provides the in-process store used by
//! the binary and the tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::RegistryError;
use crate::interop::freshness::Freshness;
use crate::lorawan::keys::RootKeySet;
use crate::lorawan::{Eui64, MacVersion, NetId};

pub use memory::{InMemoryRegistry, StaticAgreements};

/// Identifies a device across all join servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
}

impl DeviceIdentity {
    pub const fn new(join_eui: Eui64, dev_eui: Eui64) -> Self {
        Self { join_eui, dev_eui }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.join_eui, self.dev_eui)
    }
}

/// Per-device join counters.
///
/// Both counters only ever grow, so equality with a previously read state
/// is enough to detect a concurrent commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinNonceState {
    /// Last JoinNonce issued (24-bit); 0 before the first join.
    pub last_join_nonce: u32,
    /// Last DevNonce accepted; `None` before the first join.
    pub last_dev_nonce: Option<u16>,
}

impl JoinNonceState {
    /// State to commit once a join with these nonces has been answered.
    pub fn advance(&self, accepted: Freshness) -> Self {
        Self {
            last_join_nonce: accepted.join_nonce,
            last_dev_nonce: Some(accepted.dev_nonce),
        }
    }
}

/// Everything the registry knows about one device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub root_keys: RootKeySet,
    pub nonce_state: JoinNonceState,
    /// MAC version the device was provisioned with, if recorded.
    pub mac_version: Option<MacVersion>,
    pub deactivated: bool,
    pub last_joined_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn new(identity: DeviceIdentity, root_keys: RootKeySet) -> Self {
        Self {
            identity,
            root_keys,
            nonce_state: JoinNonceState::default(),
            mac_version: None,
            deactivated: false,
            last_joined_at: None,
        }
    }

    pub fn with_mac_version(mut self, version: MacVersion) -> Self {
        self.mac_version = Some(version);
        self
    }

    pub fn with_nonce_state(mut self, state: JoinNonceState) -> Self {
        self.nonce_state = state;
        self
    }

    pub fn deactivated(mut self, deactivated: bool) -> Self {
        self.deactivated = deactivated;
        self
    }
}

/// Root key and nonce-state store consumed by the join handler.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn lookup(&self, identity: &DeviceIdentity) -> Result<DeviceRecord, RegistryError>;

    /// Atomically replace the device's nonce state with `next`, but only if
    /// it still equals `expected`; otherwise fail with
    /// [`RegistryError::Conflict`] and change nothing.
    async fn commit_join(
        &self,
        identity: &DeviceIdentity,
        next: JoinNonceState,
        expected: &JoinNonceState,
    ) -> Result<(), RegistryError>;
}

/// Roaming agreements between this join server and network operators.
#[async_trait]
pub trait RoamingAgreements: Send + Sync {
    /// Whether the network identified by `net_id` may join devices under
    /// `join_eui`.
    async fn has_agreement(&self, join_eui: Eui64, net_id: NetId) -> Result<bool, RegistryError>;
}
