use std::env;
use std::time::Duration;

use crate::{
    constants::{
        DEFAULT_BACKEND_PORTFOLIO_URL, DEFAULT_BACKEND_TIMEOUT_SECS, DEFAULT_FETCH_DEADLINE_MS,
        DEFAULT_NATIVE_DECIMALS, DEFAULT_NATIVE_SYMBOL, DEFAULT_TOKEN_CONFIG,
        EVM_RPC_MAX_INFLIGHT_DEFAULT,
    },
    models::{AccountAddress, NativeCurrency, TokenSet},
    services::RetryPolicy,
    utils::{env_optional, env_or},
};

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub environment: String,

    // Chain
    pub ethereum_rpc_url: String,
    pub native_symbol: String,
    pub native_decimals: u8,
    pub tokens: TokenSet,
    pub fetch_deadline_ms: u64,
    pub evm_rpc_max_inflight: usize,

    // Backend
    pub backend_portfolio_url: String,
    pub backend_auth_token: Option<String>,
    pub backend_timeout_secs: u64,

    // Session
    pub watch_wallet_address: Option<AccountAddress>,
    pub refresh_interval_secs: u64,

    // CORS
    pub cors_allowed_origins: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let watch_wallet_address = match env_optional("WATCH_WALLET_ADDRESS") {
            Some(raw) => Some(AccountAddress::parse(&raw)?),
            None => None,
        };

        Ok(Config {
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "3000").parse()?,
            environment: env_or("ENVIRONMENT", "development"),

            ethereum_rpc_url: env::var("ETHEREUM_RPC_URL")?,
            native_symbol: env_or("NATIVE_SYMBOL", DEFAULT_NATIVE_SYMBOL),
            native_decimals: env_or("NATIVE_DECIMALS", &DEFAULT_NATIVE_DECIMALS.to_string())
                .parse()?,
            tokens: TokenSet::parse(&env_or("TOKEN_CONFIG", DEFAULT_TOKEN_CONFIG))?,
            fetch_deadline_ms: env_or("FETCH_DEADLINE_MS", &DEFAULT_FETCH_DEADLINE_MS.to_string())
                .parse()?,
            evm_rpc_max_inflight: env::var("EVM_RPC_MAX_INFLIGHT")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(EVM_RPC_MAX_INFLIGHT_DEFAULT),

            backend_portfolio_url: env_or("BACKEND_PORTFOLIO_URL", DEFAULT_BACKEND_PORTFOLIO_URL),
            backend_auth_token: env_optional("BACKEND_AUTH_TOKEN"),
            backend_timeout_secs: env_or(
                "BACKEND_TIMEOUT_SECS",
                &DEFAULT_BACKEND_TIMEOUT_SECS.to_string(),
            )
            .parse()?,

            watch_wallet_address,
            refresh_interval_secs: env_or("REFRESH_INTERVAL_SECS", "0").parse()?,

            cors_allowed_origins: env_or("CORS_ALLOWED_ORIGINS", "*"),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ethereum_rpc_url.trim().is_empty() {
            anyhow::bail!("ETHEREUM_RPC_URL is empty");
        }
        url::Url::parse(&self.ethereum_rpc_url)
            .map_err(|e| anyhow::anyhow!("ETHEREUM_RPC_URL is invalid: {}", e))?;
        url::Url::parse(&self.backend_portfolio_url)
            .map_err(|e| anyhow::anyhow!("BACKEND_PORTFOLIO_URL is invalid: {}", e))?;
        if self.native_symbol.trim().is_empty() {
            anyhow::bail!("NATIVE_SYMBOL is empty");
        }
        if self.native_decimals > crate::constants::MAX_TOKEN_DECIMALS {
            anyhow::bail!("NATIVE_DECIMALS is too large");
        }
        if self.fetch_deadline_ms == 0 {
            anyhow::bail!("FETCH_DEADLINE_MS must be > 0");
        }

        if self.tokens.is_empty() {
            tracing::warn!("TOKEN_CONFIG is empty; only the native balance will be tracked");
        }
        if self.backend_portfolio_url.starts_with("http://") && !self.is_development() {
            tracing::warn!("Backend portfolio endpoint is not using TLS");
        }
        if self.backend_timeout_secs == 0 {
            tracing::warn!("BACKEND_TIMEOUT_SECS is 0; falling back to the default timeout");
        }
        if self.refresh_outpaces_pipeline() {
            tracing::warn!(
                "REFRESH_INTERVAL_SECS={} is shorter than a worst-case pipeline run ({}ms); refreshes may supersede every sync",
                self.refresh_interval_secs,
                self.pipeline_worst_case().as_millis()
            );
        }
        if self.cors_allowed_origins.trim().is_empty() {
            tracing::warn!("CORS_ALLOWED_ORIGINS is empty; requests may be blocked");
        }

        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "testnet"
    }

    pub fn native_currency(&self) -> NativeCurrency {
        NativeCurrency {
            symbol: self.native_symbol.trim().to_string(),
            decimals: self.native_decimals,
        }
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_millis(self.fetch_deadline_ms)
    }

    /// Fetch deadline plus every backend attempt timing out with full backoff.
    pub fn pipeline_worst_case(&self) -> Duration {
        let policy = RetryPolicy::backend_sync();
        let backoff: Duration = (0..policy.max_attempts.saturating_sub(1))
            .map(|retry| policy.nominal_delay(retry))
            .sum();
        self.fetch_deadline() + self.backend_timeout() * policy.max_attempts + backoff
    }

    pub fn refresh_outpaces_pipeline(&self) -> bool {
        self.refresh_interval_secs > 0
            && Duration::from_secs(self.refresh_interval_secs) < self.pipeline_worst_case()
    }

    pub fn backend_timeout(&self) -> Duration {
        let secs = if self.backend_timeout_secs == 0 {
            DEFAULT_BACKEND_TIMEOUT_SECS
        } else {
            self.backend_timeout_secs
        };
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 3000,
        environment: "development".to_string(),
        ethereum_rpc_url: "http://localhost:8545".to_string(),
        native_symbol: "ETH".to_string(),
        native_decimals: 18,
        tokens: TokenSet::parse(DEFAULT_TOKEN_CONFIG).expect("default token config parses"),
        fetch_deadline_ms: 1_000,
        evm_rpc_max_inflight: 4,
        backend_portfolio_url: "http://127.0.0.1:8000/api/create_portfolio/".to_string(),
        backend_auth_token: None,
        backend_timeout_secs: 2,
        watch_wallet_address: None,
        refresh_interval_secs: 0,
        cors_allowed_origins: "*".to_string(),
    }
}
