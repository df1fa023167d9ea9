//! Faucet configuration

use crate::batcher::DEFAULT_BATCH_SIZE;
use crate::error::{FaucetError, FaucetResult};
use faucet_common::{Address, Coin};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// Server address
    pub server_addr: String,

    /// JSON-RPC endpoint of the signing node
    pub rpc_url: String,

    /// File listing funding account addresses, one per line
    pub funding_addresses_path: String,

    /// Amount to transfer per request
    pub transfer_amount: String,

    /// Denomination of the transferred amount
    pub denom: String,

    /// Per-IP rate limit, `<num-of-req>/<period>`
    pub ip_rate_limit: String,

    /// Maximum outputs per transaction
    pub batch_size: usize,

    /// Bound on one chain submission (seconds)
    pub dispatch_timeout_secs: u64,

    /// How long a caller waits for its transfer (seconds)
    pub request_timeout_secs: u64,

    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:8090".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            funding_addresses_path: "funding.txt".to_string(),
            transfer_amount: "100000000".to_string(),
            denom: "ucore".to_string(),
            ip_rate_limit: "2/1h".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            dispatch_timeout_secs: 20,
            request_timeout_secs: 30,
            cors_enabled: true,
        }
    }
}

impl FaucetConfig {
    /// Check values that only fail at runtime otherwise
    pub fn validate(&self) -> FaucetResult<()> {
        if self.batch_size == 0 {
            return Err(FaucetError::Config("batch_size must be greater than zero".to_string()));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(FaucetError::Config(
                "dispatch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.transfer_coin()?;
        self.rate_limit()?;
        Ok(())
    }

    pub fn transfer_coin(&self) -> FaucetResult<Coin> {
        Ok(Coin::parse(self.denom.clone(), &self.transfer_amount)?)
    }

    pub fn rate_limit(&self) -> FaucetResult<RateLimit> {
        self.ip_rate_limit.parse()
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `requests` allowed per caller within `period`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u64,
    pub period: Duration,
}

impl FromStr for RateLimit {
    type Err = FaucetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| FaucetError::Config(format!("invalid rate limit {:?}: {}", s, reason));

        let (requests, period) = s.split_once('/').ok_or_else(|| invalid("expected <num>/<period>"))?;
        let requests = requests
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("request count is not a number"))?;
        let period = parse_duration(period.trim()).ok_or_else(|| invalid("bad period"))?;

        Ok(RateLimit { requests, period })
    }
}

/// Parses `<number><unit>` with unit one of `ms`, `s`, `m`, `h`.
fn parse_duration(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Reads funding addresses, one per line. Blank lines and `#` comments are skipped.
pub fn load_funding_identities(path: impl AsRef<Path>) -> FaucetResult<Vec<Address>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        FaucetError::Config(format!("unable to read {}: {}", path.display(), e))
    })?;

    let mut identities = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let address: Address = line.parse().map_err(|e| {
            FaucetError::Config(format!("{}:{}: {}", path.display(), index + 1, e))
        })?;
        if !identities.contains(&address) {
            identities.push(address);
        }
    }

    if identities.is_empty() {
        return Err(FaucetError::Config(format!(
            "no funding address found in {}",
            path.display()
        )));
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = FaucetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.transfer_coin().unwrap(), Coin::new("ucore", 100_000_000));
        assert_eq!(
            config.rate_limit().unwrap(),
            RateLimit { requests: 2, period: Duration::from_secs(3600) }
        );
    }

    #[test]
    fn test_rate_limit_parsing() {
        assert_eq!(
            "10/30s".parse::<RateLimit>().unwrap(),
            RateLimit { requests: 10, period: Duration::from_secs(30) }
        );
        assert_eq!(
            "1/250ms".parse::<RateLimit>().unwrap().period,
            Duration::from_millis(250)
        );
        assert_eq!("5/0s".parse::<RateLimit>().unwrap().period, Duration::ZERO);

        for bad in ["", "2", "/1h", "2/", "x/1h", "2/1d", "2/h", "2/1.5h"] {
            assert!(bad.parse::<RateLimit>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = FaucetConfig { batch_size: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(FaucetError::Config(_))));

        let config = FaucetConfig { transfer_amount: "lots".to_string(), ..Default::default() };
        assert!(matches!(config.validate(), Err(FaucetError::InvalidAmount(_))));
    }

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "batch_size = 25\nip_rate_limit = \"5/10m\"").unwrap();

        let config: FaucetConfig = faucet_common::utils::config::load_config(file.path()).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.rate_limit().unwrap().period, Duration::from_secs(600));
        assert_eq!(config.denom, "ucore");
    }

    #[test]
    fn test_load_funding_identities() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# funding accounts").unwrap();
        writeln!(file, "0x0101010101010101010101010101010101010101").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "0202020202020202020202020202020202020202").unwrap();
        writeln!(file, "0x0101010101010101010101010101010101010101").unwrap();

        let identities = load_funding_identities(file.path()).unwrap();
        assert_eq!(identities, vec![Address([1u8; 20]), Address([2u8; 20])]);
    }

    #[test]
    fn test_load_funding_identities_errors() {
        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(load_funding_identities(empty.path()).is_err());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "0x1234").unwrap();
        let err = load_funding_identities(bad.path()).unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }
}
