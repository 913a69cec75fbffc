//! Relayer configuration.

use near_primitives::types::AccountId;
use serde::Deserialize;
use std::time::Duration;

/// Room for `target_account`, `auth` and JSON framing around the action.
const BODY_OVERHEAD_BYTES: usize = 16 * 1024;

/// Configuration for the relayer. Every field has a default so a bare
/// environment is enough to boot a testnet instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::rpc_url")]
    pub rpc_url: String,

    #[serde(default = "defaults::fallback_rpc_url")]
    pub fallback_rpc_url: String,

    #[serde(default = "defaults::contract_id")]
    pub contract_id: String,

    #[serde(default = "defaults::method_name")]
    pub method_name: String,

    #[serde(default = "defaults::keys_path")]
    pub keys_path: String,

    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,

    /// Fixed gas budget per transaction, in TGas.
    #[serde(default = "defaults::gas_tgas")]
    pub gas_tgas: u64,

    #[serde(default = "defaults::acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Retry ceiling for transient RPC failures and timeouts.
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "defaults::backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "defaults::attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "defaults::request_deadline_ms")]
    pub request_deadline_ms: u64,

    #[serde(default = "defaults::drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default = "defaults::max_action_bytes")]
    pub max_action_bytes: usize,

    /// Required on `/execute` when set. Unset means no authentication (dev mode).
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: defaults::rpc_url(),
            fallback_rpc_url: defaults::fallback_rpc_url(),
            contract_id: defaults::contract_id(),
            method_name: defaults::method_name(),
            keys_path: defaults::keys_path(),
            bind_address: defaults::bind_address(),
            gas_tgas: defaults::gas_tgas(),
            acquire_timeout_ms: defaults::acquire_timeout_ms(),
            max_attempts: defaults::max_attempts(),
            backoff_base_ms: defaults::backoff_base_ms(),
            backoff_max_ms: defaults::backoff_max_ms(),
            attempt_timeout_ms: defaults::attempt_timeout_ms(),
            request_deadline_ms: defaults::request_deadline_ms(),
            drain_timeout_secs: defaults::drain_timeout_secs(),
            max_action_bytes: defaults::max_action_bytes(),
            api_key: None,
        }
    }
}

impl Config {
    /// Load from `relayer.toml` (optional) overlaid with `RELAYER_*` env vars.
    ///
    /// A missing file falls back to defaults; a value that fails to parse is
    /// an error.
    pub fn load() -> Result<Self, crate::Error> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name("relayer").required(false))
            .add_source(config::Environment::with_prefix("RELAYER"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("{e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.contract_account()?;
        if self.method_name.is_empty() {
            return Err(crate::Error::Config("method_name must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(crate::Error::Config("max_attempts must be at least 1".into()));
        }
        if self.max_action_bytes == 0 {
            return Err(crate::Error::Config("max_action_bytes must be positive".into()));
        }
        let timeouts = [
            ("acquire_timeout_ms", self.acquire_timeout_ms),
            ("attempt_timeout_ms", self.attempt_timeout_ms),
            ("request_deadline_ms", self.request_deadline_ms),
            ("gas_tgas", self.gas_tgas),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(crate::Error::Config(format!("{name} must be positive")));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(crate::Error::Config(
                "backoff_base_ms must not exceed backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn contract_account(&self) -> Result<AccountId, crate::Error> {
        self.contract_id
            .parse()
            .map_err(|e| crate::Error::Config(format!("Invalid contract_id: {e}")))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// HTTP body cap for `/execute`. The validator enforces the exact action
    /// size; this only stops oversized bodies before they are buffered.
    pub fn body_limit(&self) -> usize {
        self.max_action_bytes * 2 + BODY_OVERHEAD_BYTES
    }
}

mod defaults {
    fn network() -> String {
        std::env::var("RELAYER_NETWORK")
            .or_else(|_| std::env::var("NEAR_NETWORK"))
            .unwrap_or_else(|_| "testnet".into())
    }

    pub fn rpc_url() -> String {
        if network().contains("mainnet") {
            "https://near.lava.build".into()
        } else {
            "https://neart.lava.build".into()
        }
    }

    pub fn fallback_rpc_url() -> String {
        if network().contains("mainnet") {
            "https://free.rpc.fastnear.com".into()
        } else {
            "https://test.rpc.fastnear.com".into()
        }
    }

    pub fn contract_id() -> String {
        "core.onsocial.testnet".into()
    }

    pub fn method_name() -> String {
        "execute".into()
    }

    pub fn keys_path() -> String {
        "./account_keys/relayer-pool.json".into()
    }

    pub fn bind_address() -> String {
        "0.0.0.0:3040".into()
    }

    pub fn gas_tgas() -> u64 {
        100
    }

    pub fn acquire_timeout_ms() -> u64 {
        5_000
    }

    pub fn max_attempts() -> u32 {
        3
    }

    pub fn backoff_base_ms() -> u64 {
        200
    }

    pub fn backoff_max_ms() -> u64 {
        5_000
    }

    pub fn attempt_timeout_ms() -> u64 {
        15_000
    }

    pub fn request_deadline_ms() -> u64 {
        30_000
    }

    pub fn drain_timeout_secs() -> u64 {
        30
    }

    pub fn max_action_bytes() -> usize {
        16 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.method_name, "execute");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = from_toml(
            r#"
            contract_id = "core.onsocial.near"
            max_attempts = 5
            acquire_timeout_ms = 250
            "#,
        );
        assert_eq!(config.contract_id, "core.onsocial.near");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.acquire_timeout(), Duration::from_millis(250));
        assert_eq!(config.gas_tgas, 100);
        assert_eq!(config.bind_address, "0.0.0.0:3040");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = Config {
            max_attempts: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = Config {
            attempt_timeout_ms: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("attempt_timeout_ms"));
    }

    #[test]
    fn test_validate_rejects_bad_contract_id() {
        let config = Config {
            contract_id: "Not A Valid Account!".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = Config {
            backoff_base_ms: 10_000,
            backoff_max_ms: 100,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
