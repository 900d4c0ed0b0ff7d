//! Configuration management for the marketplace client.
//!
//! Loads configuration from `TICKETCHAIN_*` environment variables (and a `.env`
//! file, if present) with defaults for a local Ganache node.

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use ticketchain_core::Address;
use url::Url;

/// Default JSON-RPC endpoint (Ganache).
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";

/// Default chain id (Ganache).
pub const DEFAULT_CHAIN_ID: u64 = 1337;

/// Token ids scanned by the bounded scan when no range is given.
pub const DEFAULT_SCAN_RANGE: (u64, u64) = (1, 50);

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("{0} is required")]
    Missing(&'static str),

    /// A variable is set but unusable
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
        /// What is wrong with it
        reason: String,
    },
}

/// How candidate token ids are enumerated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EnumerationStrategy {
    /// Use the contract's `getOwnedTickets` / `showListedTickets`
    #[default]
    Indexed,
    /// Read `ownerOf` over an inclusive id range
    BoundedScan {
        /// First id scanned
        first: u64,
        /// Last id scanned
        last: u64,
    },
}

impl fmt::Display for EnumerationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indexed => f.write_str("indexed"),
            Self::BoundedScan { first, last } => write!(f, "scan:{first}-{last}"),
        }
    }
}

impl FromStr for EnumerationStrategy {
    type Err = String;

    /// Accepts `indexed`, `scan` (ids 1 to 50) or `scan:<first>-<last>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "indexed" {
            return Ok(Self::Indexed);
        }
        if s == "scan" {
            let (first, last) = DEFAULT_SCAN_RANGE;
            return Ok(Self::BoundedScan { first, last });
        }
        let range = s
            .strip_prefix("scan:")
            .ok_or_else(|| "expected 'indexed' or 'scan:<first>-<last>'".to_string())?;
        let (first, last) = range
            .split_once('-')
            .ok_or_else(|| "scan range must look like <first>-<last>".to_string())?;
        let first: u64 = first.trim().parse().map_err(|e| format!("first id: {e}"))?;
        let last: u64 = last.trim().parse().map_err(|e| format!("last id: {e}"))?;
        if first > last {
            return Err(format!("empty range {first}-{last}"));
        }
        Ok(Self::BoundedScan { first, last })
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// JSON-RPC endpoint
    pub rpc_url: Url,
    /// Deployed ticketing contract
    pub contract_address: Address,
    /// Expected chain id; a node reporting another id is refused
    pub chain_id: u64,
    /// Account whose tickets are watched, if any
    pub account: Option<Address>,
    /// Token enumeration strategy
    pub enumeration: EnumerationStrategy,
    /// Bound on every read request
    pub read_timeout: Duration,
    /// Bound on waiting for a receipt; `None` waits indefinitely
    pub receipt_timeout: Option<Duration>,
    /// How often the subscriber polls for new blocks
    pub poll_interval: Duration,
    /// Bound on metadata fetches
    pub metadata_timeout: Duration,
    /// Prometheus listener address, if metrics are exported
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Defaults for a contract at `contract_address` behind `rpc_url`.
    #[must_use]
    pub const fn new(rpc_url: Url, contract_address: Address) -> Self {
        Self {
            rpc_url,
            contract_address,
            chain_id: DEFAULT_CHAIN_ID,
            account: None,
            enumeration: EnumerationStrategy::Indexed,
            read_timeout: Duration::from_secs(10),
            receipt_timeout: None,
            poll_interval: Duration::from_millis(2000),
            metadata_timeout: Duration::from_secs(5),
            metrics_addr: None,
        }
    }

    /// Load configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the contract address is missing or any value
    /// fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// As [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let contract_address = get("TICKETCHAIN_CONTRACT_ADDRESS")
            .ok_or(ConfigError::Missing("TICKETCHAIN_CONTRACT_ADDRESS"))?;
        let rpc_url = get("TICKETCHAIN_RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        let mut config = Self::new(
            parse("TICKETCHAIN_RPC_URL", &rpc_url)?,
            parse("TICKETCHAIN_CONTRACT_ADDRESS", &contract_address)?,
        );

        if let Some(id) = get("TICKETCHAIN_CHAIN_ID") {
            config.chain_id = parse("TICKETCHAIN_CHAIN_ID", &id)?;
        }
        if let Some(account) = get("TICKETCHAIN_ACCOUNT") {
            config.account = Some(parse("TICKETCHAIN_ACCOUNT", &account)?);
        }
        if let Some(strategy) = get("TICKETCHAIN_ENUMERATION") {
            config.enumeration = parse("TICKETCHAIN_ENUMERATION", &strategy)?;
        }
        if let Some(secs) = get("TICKETCHAIN_READ_TIMEOUT_SECS") {
            config.read_timeout = Duration::from_secs(parse("TICKETCHAIN_READ_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = get("TICKETCHAIN_RECEIPT_TIMEOUT_SECS") {
            config.receipt_timeout = Some(Duration::from_secs(parse(
                "TICKETCHAIN_RECEIPT_TIMEOUT_SECS",
                &secs,
            )?));
        }
        if let Some(ms) = get("TICKETCHAIN_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse("TICKETCHAIN_POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(secs) = get("TICKETCHAIN_METADATA_TIMEOUT_SECS") {
            config.metadata_timeout =
                Duration::from_secs(parse("TICKETCHAIN_METADATA_TIMEOUT_SECS", &secs)?);
        }
        if let Some(addr) = get("TICKETCHAIN_METRICS_ADDR") {
            config.metrics_addr = Some(parse("TICKETCHAIN_METRICS_ADDR", &addr)?);
        }

        Ok(config)
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    const CONTRACT: &str = "0x63b7acCBeE71A6a026A0BdC3a0734D74384eD15C";

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_target_local_node() {
        let config = load(&[("TICKETCHAIN_CONTRACT_ADDRESS", CONTRACT)]).unwrap();
        assert_eq!(config.rpc_url.as_str(), "http://127.0.0.1:8545/");
        assert_eq!(config.chain_id, 1337);
        assert_eq!(config.enumeration, EnumerationStrategy::Indexed);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.receipt_timeout, None);
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.account, None);
    }

    #[test]
    fn contract_address_is_required() {
        assert_eq!(
            load(&[]),
            Err(ConfigError::Missing("TICKETCHAIN_CONTRACT_ADDRESS"))
        );
        assert_eq!(
            load(&[("TICKETCHAIN_CONTRACT_ADDRESS", "  ")]),
            Err(ConfigError::Missing("TICKETCHAIN_CONTRACT_ADDRESS"))
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("TICKETCHAIN_CONTRACT_ADDRESS", CONTRACT),
            ("TICKETCHAIN_RPC_URL", "https://rpc.example.org"),
            ("TICKETCHAIN_CHAIN_ID", "11155111"),
            ("TICKETCHAIN_ACCOUNT", "0x00000000000000000000000000000000000000AA"),
            ("TICKETCHAIN_ENUMERATION", "scan:1-20"),
            ("TICKETCHAIN_RECEIPT_TIMEOUT_SECS", "90"),
            ("TICKETCHAIN_METRICS_ADDR", "127.0.0.1:9000"),
        ])
        .unwrap();
        assert_eq!(config.chain_id, 11_155_111);
        assert_eq!(
            config.enumeration,
            EnumerationStrategy::BoundedScan { first: 1, last: 20 }
        );
        assert_eq!(config.receipt_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(
            config.account.unwrap().to_string(),
            "0x00000000000000000000000000000000000000aa"
        );
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = load(&[
            ("TICKETCHAIN_CONTRACT_ADDRESS", CONTRACT),
            ("TICKETCHAIN_ENUMERATION", "scan:9-3"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "TICKETCHAIN_ENUMERATION", .. }));

        let err = load(&[("TICKETCHAIN_CONTRACT_ADDRESS", "0x1234")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "TICKETCHAIN_CONTRACT_ADDRESS", .. }));
    }

    #[test]
    fn strategy_strings() {
        assert_eq!(
            "scan".parse::<EnumerationStrategy>().unwrap(),
            EnumerationStrategy::BoundedScan { first: 1, last: 50 }
        );
        assert_eq!(
            EnumerationStrategy::BoundedScan { first: 3, last: 7 }.to_string(),
            "scan:3-7"
        );
        assert!("ranked".parse::<EnumerationStrategy>().is_err());
    }
}
