//! Scripted collaborators shared by the service tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::backend_sync::{BackendSyncClient, SyncTransport};
use super::balance_fetcher::ChainBalanceFetcher;
use super::chain_query::ChainQuery;
use super::reconciler::PortfolioReconciler;
use super::retry::RetryPolicy;
use super::session_controller::{PipelineDeps, SessionHandle, WalletSessionController};
use crate::{
    error::{AppError, Result},
    models::{AccountAddress, BalanceEntry, NativeCurrency, PortfolioSnapshot, SyncPayload, TokenSet},
};

pub const ALICE: &str = "0xABC0000000000000000000000000000000000001";
pub const BOB: &str = "0xb0b0000000000000000000000000000000000002";
pub const USDT: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";
pub const DAI: &str = "0x6B175474E89094C44Da98b954EedeAC495271d0F";

pub fn addr(raw: &str) -> AccountAddress {
    AccountAddress::parse(raw).expect("test address parses")
}

pub fn eth() -> NativeCurrency {
    NativeCurrency {
        symbol: "ETH".to_string(),
        decimals: 18,
    }
}

pub fn usdt_dai() -> TokenSet {
    TokenSet::parse(&format!("USDT:{}:6,DAI:{}:18", USDT, DAI)).expect("token set parses")
}

pub fn at_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).expect("valid timestamp")
}

pub fn snapshot(account: AccountAddress, fetched_at: DateTime<Utc>) -> PortfolioSnapshot {
    PortfolioSnapshot {
        account,
        native_balance: BalanceEntry::from_raw("ETH", U256::from(1u64), 18),
        token_balances: BTreeMap::new(),
        fetched_at,
        partial: false,
        missing: BTreeMap::new(),
    }
}

// ==================== CHAIN ====================

/// How a scripted balance query answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Value(u128),
    Fail,
    /// Fails on the first call, then answers.
    FlakyOnce(u128),
    Slow(Duration, u128),
}

#[derive(Default)]
pub struct MockChain {
    native: HashMap<AccountAddress, Reply>,
    tokens: HashMap<(AccountAddress, AccountAddress), Reply>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockChain {
    pub fn with_native(mut self, account: AccountAddress, reply: Reply) -> Self {
        self.native.insert(account, reply);
        self
    }

    pub fn with_token(mut self, account: AccountAddress, contract: &str, reply: Reply) -> Self {
        self.tokens.insert((account, addr(contract)), reply);
        self
    }

    pub fn calls(&self, key: &str) -> u32 {
        self.calls
            .lock()
            .expect("calls lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    async fn answer(&self, key: String, reply: Option<Reply>) -> Result<U256> {
        let call = {
            let mut calls = self.calls.lock().expect("calls lock");
            let count = calls.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match reply {
            Some(Reply::Value(value)) => Ok(U256::from(value)),
            Some(Reply::FlakyOnce(value)) if call > 1 => Ok(U256::from(value)),
            Some(Reply::FlakyOnce(_)) => Err(AppError::BlockchainRPC("connection reset".into())),
            Some(Reply::Slow(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(U256::from(value))
            }
            Some(Reply::Fail) => Err(AppError::BlockchainRPC("execution reverted".into())),
            None => Err(AppError::BlockchainRPC(format!("no script for {}", key))),
        }
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    async fn query_native_balance(&self, account: &AccountAddress) -> Result<U256> {
        let reply = self.native.get(account).cloned();
        self.answer(format!("native:{}", account), reply).await
    }

    async fn query_token_balance(
        &self,
        account: &AccountAddress,
        contract: &AccountAddress,
    ) -> Result<U256> {
        let reply = self.tokens.get(&(*account, *contract)).cloned();
        self.answer(format!("token:{}:{}", account, contract), reply)
            .await
    }
}

// ==================== BACKEND ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPost {
    pub account: AccountAddress,
    pub fetched_at: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Records every post it receives and answers from a script, then `Ok`.
#[derive(Default)]
pub struct RecordingTransport {
    script: Mutex<VecDeque<Result<()>>>,
    delay: Option<Duration>,
    posts: Mutex<Vec<ReceivedPost>>,
}

impl RecordingTransport {
    pub fn scripted(replies: Vec<Result<()>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn posts(&self) -> Vec<ReceivedPost> {
        self.posts.lock().expect("posts lock").clone()
    }

    pub fn posted_accounts(&self) -> Vec<AccountAddress> {
        self.posts().into_iter().map(|post| post.account).collect()
    }
}

#[async_trait]
impl SyncTransport for RecordingTransport {
    async fn post_portfolio(&self, payload: &SyncPayload<'_>, idempotency_key: &str) -> Result<()> {
        self.posts.lock().expect("posts lock").push(ReceivedPost {
            account: *payload.account,
            fetched_at: *payload.fetched_at,
            idempotency_key: idempotency_key.to_string(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

// ==================== SESSION ====================

/// Chain script where `account` holds 2.5 ETH, 150 USDT and 1 DAI.
pub fn funded(chain: MockChain, account: AccountAddress) -> MockChain {
    chain
        .with_native(account, Reply::Value(2_500_000_000_000_000_000))
        .with_token(account, USDT, Reply::Value(150_000_000))
        .with_token(account, DAI, Reply::Value(1_000_000_000_000_000_000))
}

/// Spawns a controller over scripted collaborators, tracking USDT and DAI.
pub fn spawn_session(chain: MockChain, transport: Arc<RecordingTransport>) -> SessionHandle {
    let sync = Arc::new(BackendSyncClient::new(transport, RetryPolicy::backend_sync()));
    spawn_session_with_sync(chain, sync)
}

/// Like `spawn_session`, but the caller keeps a handle on the sync client.
pub fn spawn_session_with_sync(chain: MockChain, sync: Arc<BackendSyncClient>) -> SessionHandle {
    WalletSessionController::spawn(PipelineDeps {
        fetcher: Arc::new(ChainBalanceFetcher::new(
            Arc::new(chain),
            eth(),
            RetryPolicy::balance_query(),
        )),
        reconciler: PortfolioReconciler::new(),
        sync,
        tokens: usdt_dai(),
        fetch_deadline: Duration::from_secs(10),
    })
}
