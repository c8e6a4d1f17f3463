//! Configuration for a repo.

/// Default number of times a transaction is retried before aborting.
pub const DEFAULT_MAX_TRANSACTION_RETRIES: u32 = 25;

/// Configuration for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    /// Host of the remote authority.
    pub host: String,
    /// Database namespace.
    pub namespace: String,
    /// Whether the connection is encrypted.
    pub secure: bool,
    /// Transaction retry bound.
    pub max_transaction_retries: u32,
    /// Prefix attached to log records.
    pub log_prefix: Option<String>,
}

impl RepoConfig {
    /// Creates a new configuration.
    pub fn new(host: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            secure: true,
            max_transaction_retries: DEFAULT_MAX_TRANSACTION_RETRIES,
            log_prefix: None,
        }
    }

    /// Sets whether the connection is encrypted.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the transaction retry bound.
    pub fn with_max_transaction_retries(mut self, retries: u32) -> Self {
        self.max_transaction_retries = retries;
        self
    }

    /// Sets the log prefix.
    pub fn with_log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = Some(prefix.into());
        self
    }

    /// URL of the database, used as the registry key.
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}?ns={}", self.host, self.namespace)
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self::new("localhost:9000", "default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_config_builder() {
        let config = RepoConfig::new("db.example.com", "prod")
            .with_secure(false)
            .with_max_transaction_retries(5)
            .with_log_prefix("[app]");

        assert_eq!(config.url(), "http://db.example.com?ns=prod");
        assert_eq!(config.max_transaction_retries, 5);
        assert_eq!(config.log_prefix.as_deref(), Some("[app]"));
    }

    #[test]
    fn defaults() {
        let config = RepoConfig::default();
        assert!(config.secure);
        assert_eq!(config.max_transaction_retries, DEFAULT_MAX_TRANSACTION_RETRIES);
    }
}
