use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider},
    types::U256,
};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    config::Config,
    error::{AppError, Result},
    models::AccountAddress,
};

/// Balance reads the wallet provider exposes. Both calls are fallible and
/// return smallest-unit integers.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    async fn query_native_balance(&self, account: &AccountAddress) -> Result<U256>;

    async fn query_token_balance(
        &self,
        account: &AccountAddress,
        contract: &AccountAddress,
    ) -> Result<U256>;
}

/// JSON-RPC backed reader: `eth_getBalance` and ERC-20 `balanceOf`.
pub struct EvmChainQuery {
    provider: Arc<Provider<Http>>,
    inflight: Arc<Semaphore>,
}

impl EvmChainQuery {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.ethereum_rpc_url, config.evm_rpc_max_inflight)
    }

    pub fn new(rpc_url: &str, max_inflight: usize) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| AppError::Config(format!("Invalid EVM RPC URL: {}", e)))?;
        Ok(Self {
            provider: Arc::new(provider),
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        })
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        self.inflight
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(format!("EVM RPC semaphore closed: {}", e)))
    }
}

#[async_trait]
impl ChainQuery for EvmChainQuery {
    async fn query_native_balance(&self, account: &AccountAddress) -> Result<U256> {
        let _permit = self.permit().await?;
        self.provider
            .get_balance(account.as_address(), None)
            .await
            .map_err(|e| AppError::BlockchainRPC(format!("eth_getBalance: {}", e)))
    }

    async fn query_token_balance(
        &self,
        account: &AccountAddress,
        contract: &AccountAddress,
    ) -> Result<U256> {
        let _permit = self.permit().await?;
        let erc20 = Erc20::new(contract.as_address(), self.provider.clone());
        erc20
            .balance_of(account.as_address())
            .call()
            .await
            .map_err(|e| AppError::BlockchainRPC(format!("balanceOf({}): {}", contract, e)))
    }
}

ethers::contract::abigen!(
    Erc20,
    r#"[
        function balanceOf(address) view returns (uint256)
    ]"#
);
