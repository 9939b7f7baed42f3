//! Distributor configuration
//!
//! Loaded from JSON. Durations are human readable (`"5s"`, `"1m 30s"`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use dav_core::{DavError, DavResult, DistributorId, UserId};
use dav_crypto::{ClientCredentials, CredentialStore};
use dav_transport::ChannelConfig;

use crate::topology::{EdgeConfig, Topology};

/// Protocol versions this implementation speaks
pub const SUPPORTED_PROTOCOL_VERSIONS: [i32; 2] = [2, 3];

/// First protocol version with SRP authentication
pub const SRP_PROTOCOL_VERSION: i32 = 3;

/// Lower bound for the reconnect delay
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Lower bound for the connect retry window
pub const MIN_CONNECT_WINDOW: Duration = Duration::from_secs(1);

/// Whether an authenticated link may drop its encryption
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    /// Links stay encrypted
    #[default]
    Always,
    /// Loopback links run unencrypted
    AllowDisableOnLoopback,
    /// Every link runs unencrypted (trusted network)
    AllowDisable,
}

impl EncryptionPolicy {
    pub fn allows_disable(self, loopback: bool) -> bool {
        match self {
            EncryptionPolicy::Always => false,
            EncryptionPolicy::AllowDisableOnLoopback => loopback,
            EncryptionPolicy::AllowDisable => true,
        }
    }
}

/// Log output settings
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// User account known to this distributor
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub user: String,
    pub id: u64,
    pub password: String,
    #[serde(default)]
    pub one_time_passwords: Vec<OneTimePasswordConfig>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("user", &self.user)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize)]
pub struct OneTimePasswordConfig {
    pub index: u32,
    pub password: String,
}

/// Credentials this distributor logs in with at its neighbours
#[derive(Clone, Deserialize)]
pub struct LoginConfig {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for LoginConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginConfig")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Distributor configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Id of this distributor
    pub distributor_id: u64,
    /// Listen address. Derived from the topology entry of this
    /// distributor when absent.
    pub listen_address: Option<SocketAddr>,
    pub protocol_versions: Vec<i32>,
    /// Wait before a lost outgoing link is reconnected
    #[serde(deserialize_with = "duration_str")]
    pub reconnect_delay: Duration,
    /// Bounded wait for each synchronous handshake reply
    #[serde(deserialize_with = "duration_str")]
    pub handshake_timeout: Duration,
    /// How long one connect task keeps retrying before giving up
    #[serde(deserialize_with = "duration_str")]
    pub connect_window: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub send_keep_alive: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub receive_keep_alive: Duration,
    /// Delay before a disabled distributor is thrown out after it logged in
    #[serde(deserialize_with = "duration_str")]
    pub disabled_grace: Duration,
    /// Concurrent outgoing connect attempts
    pub max_parallel_connects: usize,
    pub allow_legacy_authentication: bool,
    pub encryption: EncryptionPolicy,
    /// Default login at neighbours
    pub login: Option<LoginConfig>,
    /// Logins for edges that name their own user
    pub edge_logins: Vec<LoginConfig>,
    /// Accounts neighbours may log in with
    pub accounts: Vec<AccountConfig>,
    /// Distributors whose links are administratively disabled
    pub disabled: Vec<u64>,
    pub topology: Vec<EdgeConfig>,
    pub log: LogConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        DistributorConfig {
            distributor_id: 0,
            listen_address: None,
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
            reconnect_delay: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(30),
            connect_window: Duration::from_secs(60),
            send_keep_alive: Duration::from_secs(20),
            receive_keep_alive: Duration::from_secs(30),
            disabled_grace: Duration::from_secs(60),
            max_parallel_connects: 4,
            allow_legacy_authentication: false,
            encryption: EncryptionPolicy::Always,
            login: None,
            edge_logins: Vec::new(),
            accounts: Vec::new(),
            disabled: Vec::new(),
            topology: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl DistributorConfig {
    pub fn from_json_str(json: &str) -> DavResult<Self> {
        let config: DistributorConfig =
            serde_json::from_str(json).map_err(|e| DavError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn local_id(&self) -> DistributorId {
        DistributorId::new(self.distributor_id)
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> DavResult<()> {
        if self.reconnect_delay < MIN_RECONNECT_DELAY {
            return Err(DavError::InvalidConfig(format!(
                "reconnect delay {} is below {}",
                humantime::format_duration(self.reconnect_delay),
                humantime::format_duration(MIN_RECONNECT_DELAY)
            )));
        }
        if self.handshake_timeout.is_zero() {
            return Err(DavError::InvalidConfig("handshake timeout must not be zero".into()));
        }
        if self.max_parallel_connects == 0 {
            return Err(DavError::InvalidConfig("max_parallel_connects must not be zero".into()));
        }
        if self.receive_keep_alive <= self.send_keep_alive {
            return Err(DavError::InvalidConfig(
                "receive keep-alive must be longer than send keep-alive".into(),
            ));
        }
        if self.protocol_versions.is_empty() {
            return Err(DavError::InvalidConfig("no protocol versions configured".into()));
        }
        if let Some(v) = self
            .protocol_versions
            .iter()
            .find(|v| !SUPPORTED_PROTOCOL_VERSIONS.contains(v))
        {
            return Err(DavError::InvalidConfig(format!("unsupported protocol version {}", v)));
        }
        Ok(())
    }

    /// Connect retry window, never shorter than [`MIN_CONNECT_WINDOW`]
    pub fn effective_connect_window(&self) -> Duration {
        self.connect_window.max(MIN_CONNECT_WINDOW)
    }

    /// Validated topology
    pub fn topology(&self) -> DavResult<Topology> {
        Topology::from_config(self.local_id(), &self.topology)
    }

    pub fn disabled_distributors(&self) -> Vec<DistributorId> {
        self.disabled.iter().copied().map(DistributorId::new).collect()
    }

    /// Login for a link; an edge may name its own user
    pub fn credentials_for(&self, edge_user: Option<&str>) -> Option<ClientCredentials> {
        match edge_user {
            Some(user) => self
                .edge_logins
                .iter()
                .chain(self.login.iter())
                .find(|l| l.user == user)
                .map(|l| ClientCredentials::new(&l.user, &l.password)),
            None => self
                .login
                .as_ref()
                .map(|l| ClientCredentials::new(&l.user, &l.password)),
        }
    }

    /// In-memory user database seeded from `accounts`
    pub fn credential_store(&self) -> DavResult<Arc<CredentialStore>> {
        let store = CredentialStore::new();
        for account in &self.accounts {
            store.add_user(&account.user, UserId::new(account.id), &account.password);
            for otp in &account.one_time_passwords {
                store.add_one_time_password(&account.user, otp.index, &otp.password)?;
            }
        }
        Ok(Arc::new(store))
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            send_keep_alive: self.send_keep_alive,
            receive_keep_alive: self.receive_keep_alive,
            ..ChannelConfig::default()
        }
    }
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DistributorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol_versions, vec![2, 3]);
        assert_eq!(config.disabled_grace, Duration::from_secs(60));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "distributor_id": 10,
            "listen_address": "127.0.0.1:8083",
            "reconnect_delay": "2s",
            "handshake_timeout": "10s",
            "encryption": "allow_disable_on_loopback",
            "login": { "user": "dav10", "password": "secret" },
            "edge_logins": [ { "user": "special", "password": "other" } ],
            "accounts": [ { "user": "dav20", "id": 20, "password": "pw20",
                            "one_time_passwords": [ { "index": 1, "password": "otp" } ] } ],
            "disabled": [30],
            "log": { "level": "debug", "json": true }
        }"#;
        let config = DistributorConfig::from_json_str(json).unwrap();
        assert_eq!(config.local_id(), DistributorId::new(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.encryption, EncryptionPolicy::AllowDisableOnLoopback);
        assert_eq!(config.disabled_distributors(), vec![DistributorId::new(30)]);
        assert!(config.log.json);

        assert_eq!(config.credentials_for(None).unwrap().user, "dav10");
        assert_eq!(config.credentials_for(Some("special")).unwrap().password, "other");
        assert!(config.credentials_for(Some("ghost")).is_none());

        let store = config.credential_store().unwrap();
        assert!(store.contains("dav20"));
    }

    #[test]
    fn test_rejects_short_reconnect_delay() {
        let json = r#"{ "reconnect_delay": "200ms" }"#;
        assert!(matches!(
            DistributorConfig::from_json_str(json),
            Err(DavError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_bad_duration() {
        let json = r#"{ "handshake_timeout": "soon" }"#;
        assert!(DistributorConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let config = DistributorConfig {
            protocol_versions: vec![3, 9],
            ..DistributorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encryption_policy() {
        assert!(!EncryptionPolicy::Always.allows_disable(true));
        assert!(EncryptionPolicy::AllowDisableOnLoopback.allows_disable(true));
        assert!(!EncryptionPolicy::AllowDisableOnLoopback.allows_disable(false));
        assert!(EncryptionPolicy::AllowDisable.allows_disable(false));
    }

    #[test]
    fn test_connect_window_floor() {
        let config = DistributorConfig {
            connect_window: Duration::from_millis(10),
            ..DistributorConfig::default()
        };
        assert_eq!(config.effective_connect_window(), MIN_CONNECT_WINDOW);
    }
}
