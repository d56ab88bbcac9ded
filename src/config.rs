use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::interop::{JoinServer, Peer};
use crate::lorawan::keys::{AesKey, RootKeySet};
use crate::lorawan::{Eui64, MacVersion, NetId};
use crate::registry::{DeviceIdentity, DeviceRecord, KeyRegistry, StaticAgreements};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub join_server: JoinServerConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub agreements: Vec<AgreementConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinServerConfig {
    /// JoinEUIs this join server answers for
    #[serde(default)]
    pub join_euis: Vec<Eui64>,
    #[serde(default = "default_answer_deadline_ms")]
    pub answer_deadline_ms: u64,
    pub session_lifetime_s: Option<u32>,
}

fn default_answer_deadline_ms() -> u64 {
    2000
}

/// A network server allowed to send JoinReqs
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub net_id: NetId,
    /// Source address the peer sends from; stands in for transport
    /// authentication on the datagram listener.
    pub addr: String,
    pub kek_label: String,
    pub kek: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgreementConfig {
    pub net_id: NetId,
    pub join_euis: Vec<Eui64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub nwk_key: String,
    pub app_key: Option<String>,
    pub mac_version: Option<String>,
    #[serde(default)]
    pub deactivated: bool,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn parse_key(what: &str, hex: &str) -> anyhow::Result<AesKey> {
    hex.parse::<AesKey>()
        .with_context(|| format!("{} must be 32 hex characters", what))
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Check key material, addresses and versions before anything is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid server.bind {:?}", self.server.bind))?;
        self.peers()?;
        self.peer_addresses()?;
        self.device_records()?;
        Ok(())
    }

    pub fn answer_deadline(&self) -> Duration {
        Duration::from_millis(self.join_server.answer_deadline_ms)
    }

    pub fn peers(&self) -> anyhow::Result<Vec<Peer>> {
        self.peers
            .iter()
            .map(|p| {
                Ok(Peer {
                    net_id: p.net_id,
                    kek_label: p.kek_label.clone(),
                    kek: parse_key(&format!("kek of peer {}", p.net_id), &p.kek)?,
                })
            })
            .collect()
    }

    /// Source address → NetID of the peer sending from it.
    pub fn peer_addresses(&self) -> anyhow::Result<HashMap<SocketAddr, NetId>> {
        let mut addresses = HashMap::new();
        for peer in &self.peers {
            let addr = peer
                .addr
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid addr {:?} for peer {}", peer.addr, peer.net_id))?;
            if let Some(other) = addresses.insert(addr, peer.net_id) {
                anyhow::bail!("peers {} and {} share address {}", other, peer.net_id, addr);
            }
        }
        Ok(addresses)
    }

    pub fn agreements(&self) -> StaticAgreements {
        self.agreements
            .iter()
            .flat_map(|a| a.join_euis.iter().map(move |eui| (a.net_id, *eui)))
            .fold(StaticAgreements::new(), |acc, (net_id, join_eui)| {
                acc.allow(net_id, join_eui)
            })
    }

    pub fn device_records(&self) -> anyhow::Result<Vec<DeviceRecord>> {
        self.devices
            .iter()
            .map(|d| {
                let identity = DeviceIdentity::new(d.join_eui, d.dev_eui);
                let root_keys = RootKeySet {
                    nwk_key: parse_key(&format!("nwk_key of {}", identity), &d.nwk_key)?,
                    app_key: d
                        .app_key
                        .as_deref()
                        .map(|k| parse_key(&format!("app_key of {}", identity), k))
                        .transpose()?,
                };

                let mut record = DeviceRecord::new(identity, root_keys).deactivated(d.deactivated);
                if let Some(version) = &d.mac_version {
                    let version = version
                        .parse::<MacVersion>()
                        .with_context(|| format!("mac_version of {}", identity))?;
                    record = record.with_mac_version(version);
                }
                Ok(record)
            })
            .collect()
    }

    /// Join server answering for the configured JoinEUIs and peers.
    pub fn join_server(&self, registry: Arc<dyn KeyRegistry>) -> anyhow::Result<JoinServer> {
        let mut server = JoinServer::new(registry, Arc::new(self.agreements()));
        for peer in self.peers()? {
            server = server.with_peer(peer);
        }
        for join_eui in &self.join_server.join_euis {
            server = server.serve_join_eui(*join_eui);
        }
        if let Some(lifetime) = self.join_server.session_lifetime_s {
            server = server.with_session_lifetime(lifetime);
        }
        Ok(server)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0:4700".to_string(),
            },
            join_server: JoinServerConfig {
                join_euis: Vec::new(),
                answer_deadline_ms: default_answer_deadline_ms(),
                session_lifetime_s: None,
            },
            peers: Vec::new(),
            agreements: Vec::new(),
            devices: Vec::new(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RoamingAgreements;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
bind = "127.0.0.1:4700"

[join_server]
join_euis = ["70B3D57ED0000001"]
answer_deadline_ms = 500
session_lifetime_s = 86400

[[peers]]
net_id = "000013"
addr = "127.0.0.1:4701"
kek_label = "ns-000013"
kek = "000102030405060708090A0B0C0D0E0F"

[[agreements]]
net_id = "000013"
join_euis = ["70B3D57ED0000001"]

[[devices]]
join_eui = "70B3D57ED0000001"
dev_eui = "0004A30B001C0530"
nwk_key = "2B7E151628AED2A6ABF7158809CF4F3C"
app_key = "5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A5A"
mac_version = "1.1"

[[devices]]
join_eui = "70B3D57ED0000001"
dev_eui = "0004A30B001C0531"
nwk_key = "2B7E151628AED2A6ABF7158809CF4F3C"
mac_version = "1.0.3"
deactivated = true

[logging]
level = "debug"
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample() {
        let file = write_config(SAMPLE);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:4700");
        assert_eq!(config.answer_deadline(), Duration::from_millis(500));
        assert_eq!(config.logging.level, "debug");

        let peers = config.peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].net_id, NetId::new(0x13));

        let addresses = config.peer_addresses().unwrap();
        assert_eq!(
            addresses.get(&"127.0.0.1:4701".parse().unwrap()),
            Some(&NetId::new(0x13))
        );

        let records = config.device_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mac_version, Some(MacVersion::V1_1));
        assert!(records[0].root_keys.app_key.is_some());
        assert!(records[1].deactivated);
        assert!(records[1].root_keys.app_key.is_none());
    }

    #[tokio::test]
    async fn test_agreements_from_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let agreements = config.agreements();
        let join_eui: Eui64 = "70B3D57ED0000001".parse().unwrap();

        assert!(agreements.has_agreement(join_eui, NetId::new(0x13)).await.unwrap());
        assert!(!agreements.has_agreement(join_eui, NetId::new(0x14)).await.unwrap());
    }

    #[test]
    fn test_short_key_rejected() {
        let file = write_config(&SAMPLE.replace(
            "kek = \"000102030405060708090A0B0C0D0E0F\"",
            "kek = \"0001020304\"",
        ));
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("kek of peer 000013"));
    }

    #[test]
    fn test_unknown_mac_version_rejected() {
        let config: Config = toml::from_str(&SAMPLE.replace("\"1.0.3\"", "\"1.3\"")).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/join-server.toml")).is_err());
    }

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        tokio_test::assert_ok!(config.validate());
        assert_eq!(config.answer_deadline(), Duration::from_millis(2000));
    }
}
