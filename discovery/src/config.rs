use std::time::Duration;

use crate::Error;

pub const DEFAULT_KEY_PREFIX: &str = "pingservice";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_IDLE_PER_BACKEND: usize = 8;

/// Connection settings for the coordination store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
}

impl StoreConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(Error::Config(
                "at least one coordination store endpoint is required".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for a backend registering itself.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub key_prefix: String,
    /// Address clients use to reach this backend (scheme + host + port).
    pub external_address: String,
    /// Whole seconds, at least 1.
    pub lease_ttl: Duration,
    /// Must be strictly shorter than `lease_ttl`.
    pub renew_interval: Duration,
    /// Deadline for each grant / put / keep-alive call.
    pub request_timeout: Duration,
}

impl RegistrarConfig {
    pub fn new(key_prefix: impl Into<String>, external_address: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            external_address: external_address.into(),
            lease_ttl: DEFAULT_LEASE_TTL,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            request_timeout: DEFAULT_STORE_REQUEST_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.external_address.is_empty() {
            return Err(Error::Config("external address must not be empty".into()));
        }
        if self.lease_ttl < Duration::from_secs(1) {
            return Err(Error::Config(format!(
                "lease TTL must be at least 1s, got {:?}",
                self.lease_ttl
            )));
        }
        // Leases are granted in whole seconds
        if self.lease_ttl.subsec_nanos() != 0 {
            return Err(Error::Config(format!(
                "lease TTL must be a whole number of seconds, got {:?}",
                self.lease_ttl
            )));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_ttl {
            return Err(Error::Config(format!(
                "renew interval {:?} must be non-zero and shorter than lease TTL {:?}",
                self.renew_interval, self.lease_ttl
            )));
        }
        Ok(())
    }
}

/// Settings for a client keeping a membership view.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub key_prefix: String,
    /// Per-call timeout for liveness requests to backends.
    pub request_timeout: Duration,
    /// Idle connections kept per backend host.
    pub max_idle_per_backend: usize,
    /// Re-bootstrap from a fresh snapshot when the change stream ends.
    /// When false the view goes stale after a stream loss.
    pub resync_on_stream_loss: bool,
}

impl SyncConfig {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            request_timeout: DEFAULT_PING_TIMEOUT,
            max_idle_per_backend: DEFAULT_MAX_IDLE_PER_BACKEND,
            resync_on_stream_loss: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registrar_config_is_valid() {
        let config = RegistrarConfig::new(DEFAULT_KEY_PREFIX, "http://localhost:8200");
        assert!(config.validate().is_ok());
        assert!(config.renew_interval < config.lease_ttl);
    }

    #[test]
    fn test_renew_interval_must_be_shorter_than_ttl() {
        let mut config = RegistrarConfig::new("svc", "http://h:1");
        config.renew_interval = config.lease_ttl;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.renew_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_sub_second_ttl_is_rejected() {
        let mut config = RegistrarConfig::new("svc", "http://h:1");
        config.lease_ttl = Duration::from_millis(500);
        config.renew_interval = Duration::from_millis(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fractional_ttl_is_rejected() {
        let mut config = RegistrarConfig::new("svc", "http://h:1");
        config.lease_ttl = Duration::from_millis(1500);
        config.renew_interval = Duration::from_millis(1400);
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.lease_ttl = Duration::from_secs(2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_config_requires_an_endpoint() {
        assert!(StoreConfig::new(vec![]).validate().is_err());
        assert!(StoreConfig::new(vec!["  ".into()]).validate().is_err());
        assert!(StoreConfig::new(vec!["http://localhost:2379".into()])
            .validate()
            .is_ok());
    }
}
