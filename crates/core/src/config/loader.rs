//! Configuration loading: file, `${VAR}` expansion, environment overrides.

use super::IndexerConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

/// Default config location when `INDEXER_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "./config/indexer.toml";

impl IndexerConfig {
    /// Expand `${VAR}` references in string fields.
    pub fn expand_env_vars(&mut self) {
        self.chain.rpc_url = expand_env(&self.chain.rpc_url);
        self.storage.database_url = expand_env(&self.storage.database_url);
        self.price.api_url = expand_env(&self.price.api_url);
        self.alerts.telegram_bot_token = expand_env(&self.alerts.telegram_bot_token);
        self.alerts.telegram_chat_id = expand_env(&self.alerts.telegram_chat_id);
    }

    /// Apply well-known environment overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("RPC_URL") {
            self.chain.rpc_url = url;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.alerts.telegram_bot_token = token;
        }
        if let Some(chat) = lookup("TELEGRAM_CHAT_ID") {
            self.alerts.telegram_chat_id = chat;
        }
        if !self.alerts.telegram_bot_token.is_empty() && !self.alerts.telegram_chat_id.is_empty() {
            self.alerts.enabled = true;
        }
    }
}

/// Load, expand, override and validate the configuration at `path`.
///
/// A missing file yields defaults, which only validate if the overrides
/// leave the core contracts configured.
pub fn load_config(path: impl AsRef<Path>) -> Result<IndexerConfig> {
    let path = path.as_ref();
    let mut config = if path.exists() {
        info!(path = %path.display(), "Loading configuration");
        IndexerConfig::from_file(path)
            .with_context(|| format!("Failed to parse config {}", path.display()))?
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        IndexerConfig::default()
    };

    config.expand_env_vars();
    config.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    config.validate()?;
    Ok(config)
}

/// Load from `INDEXER_CONFIG` or the default path.
pub fn load_config_from_env() -> Result<IndexerConfig> {
    let path = std::env::var("INDEXER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config(path)
}

/// Expand environment variables in a string (${VAR} syntax).
fn expand_env(s: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };
    re.replace_all(s, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use std::collections::HashMap;

    #[test]
    fn test_expand_env() {
        std::env::set_var("INDEXER_TEST_EXPAND_HOST", "node.example");
        assert_eq!(
            expand_env("https://${INDEXER_TEST_EXPAND_HOST}/rpc"),
            "https://node.example/rpc"
        );
        assert_eq!(
            expand_env("${INDEXER_TEST_DEFINITELY_UNSET}"),
            "${INDEXER_TEST_DEFINITELY_UNSET}"
        );
        assert_eq!(expand_env("plain"), "plain");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("RPC_URL", "http://archive:8545"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "-100"),
        ]
        .into_iter()
        .collect();

        let mut config = IndexerConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.chain.rpc_url, "http://archive:8545");
        assert_eq!(config.storage.database_url, "sqlite://indexer.db");
        assert!(config.alerts.enabled);
    }

    #[test]
    fn test_load_missing_file_fails_validation() {
        let result = load_config("/nonexistent/indexer.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("indexer-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("indexer.toml");
        std::fs::write(
            &path,
            r#"
            [contracts]
            token = "0x1111111111111111111111111111111111111111"
            minting_hub = "0x2222222222222222222222222222222222222222"

            [fetcher]
            chunk_size = 250
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.contracts.token, Some(Address::repeat_byte(0x11)));
        assert_eq!(config.fetcher.chunk_size, 250);
        std::fs::remove_dir_all(&dir).ok();
    }
}
