//! Shared settings every tunnel of one listener is created from

use crate::config::TunnelConfig;
use crate::crypto::{KeySource, RandomKeySource};
use crate::session::TokenCache;
use crate::validation::{AcceptAllValidator, Validator};
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Master configuration cloned into each tunnel
///
/// Clones share the token cache, so a client reconnecting to the same
/// server can reuse the secret of an earlier connection.
#[derive(Clone)]
pub struct TunnelTemplate {
    pub config: TunnelConfig,
    pub tokens: Arc<TokenCache>,
    pub validator: Arc<dyn Validator>,
    pub key_source: Arc<dyn KeySource>,
    /// Limit on outbound connects made on behalf of a tunnel
    pub connect_timeout: Option<Duration>,
}

impl TunnelTemplate {
    pub fn new(config: TunnelConfig) -> Self {
        let tokens = TokenCache::new(config.key_lifetime());
        Self {
            config,
            tokens,
            validator: Arc::new(AcceptAllValidator),
            key_source: Arc::new(RandomKeySource),
            connect_timeout: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_key_source(mut self, key_source: Arc<dyn KeySource>) -> Self {
        self.key_source = key_source;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// DH exponent for one exchange: the fixed key if configured, otherwise
    /// a fresh one from the key source
    pub async fn private_key(&self) -> Result<String> {
        match self.config.private_key() {
            Some(key) => Ok(key.to_string()),
            None => self.key_source.generate_key().await,
        }
    }
}

impl fmt::Debug for TunnelTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelTemplate")
            .field("config", &self.config)
            .field("validator", &self.validator)
            .field("key_source", &self.key_source)
            .field("cached_keys", &self.tokens.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_private_key_wins() {
        let mut config = TunnelConfig::default();
        config.set_private_key(Some("00ff 00ff")).unwrap();

        let template = TunnelTemplate::new(config);
        assert_eq!(template.private_key().await.unwrap(), "00ff00ff");
    }

    #[tokio::test]
    async fn test_clones_share_token_cache() {
        let template = TunnelTemplate::new(TunnelConfig::default());
        let clone = template.clone();

        clone.tokens.set_key_for_token(7, "abcd");
        assert_eq!(template.tokens.key_for_token(7).as_deref(), Some("abcd"));
        assert_eq!(template.private_key().await.unwrap().len(), 40);
    }
}
