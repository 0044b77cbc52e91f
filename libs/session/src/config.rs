use std::time::Duration;

const MAX_OPERATION_TIMEOUT_ENV: &str = "HDC_MAX_OPERATION_TIMEOUT_MS";
const RENEWAL_MARGIN_ENV: &str = "HDC_TOKEN_RENEWAL_MARGIN_SECS";
const RENEWAL_RETRY_ENV: &str = "HDC_RENEWAL_RETRY_SECS";

/// Tunables for a device session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Total time a recovery episode may spend before escalating.
    pub max_operation_timeout: Duration,
    /// How long before token expiry renewal fires.
    pub token_renewal_margin: Duration,
    /// Re-arm delay after a failed renewal.
    pub renewal_retry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_operation_timeout: Duration::from_millis(240_000),
            token_renewal_margin: Duration::from_secs(900),
            renewal_retry_interval: Duration::from_secs(15),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let parse = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .and_then(|raw| raw.parse::<u64>().ok())
        };
        if let Some(ms) = parse(MAX_OPERATION_TIMEOUT_ENV) {
            cfg.max_operation_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(RENEWAL_MARGIN_ENV) {
            cfg.token_renewal_margin = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(RENEWAL_RETRY_ENV) {
            cfg.renewal_retry_interval = Duration::from_secs(secs.max(1));
        }
        cfg
    }

    pub fn with_max_operation_timeout(mut self, timeout: Duration) -> Self {
        self.max_operation_timeout = timeout;
        self
    }

    pub fn with_token_renewal_margin(mut self, margin: Duration) -> Self {
        self.token_renewal_margin = margin;
        self
    }

    pub fn with_renewal_retry_interval(mut self, interval: Duration) -> Self {
        self.renewal_retry_interval = interval;
        self
    }
}
