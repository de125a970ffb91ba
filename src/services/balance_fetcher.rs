use ethers::types::U256;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;

use super::chain_query::ChainQuery;
use super::retry::{retry_with_backoff, RetryPolicy};
use crate::{
    error::{AppError, Result},
    models::{AccountAddress, BalanceEntry, NativeCurrency, TokenSet},
};

const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Raw results of one fetch run, before reconciliation.
#[derive(Debug, Clone)]
pub struct BalanceFragments {
    pub native: BalanceEntry,
    /// One entry per configured token; `Err` is always `AppError::QueryFailed`.
    pub tokens: BTreeMap<String, Result<BalanceEntry>>,
    pub deadline_elapsed: bool,
}

enum Slot {
    Native,
    Token(usize),
}

type SlotFuture<'a> = Pin<Box<dyn Future<Output = (Slot, Result<U256>)> + Send + 'a>>;

/// Chain Balance Fetcher - reads the native and token balances of one account
pub struct ChainBalanceFetcher {
    chain: Arc<dyn ChainQuery>,
    native: NativeCurrency,
    policy: RetryPolicy,
}

impl ChainBalanceFetcher {
    pub fn new(chain: Arc<dyn ChainQuery>, native: NativeCurrency, policy: RetryPolicy) -> Self {
        Self {
            chain,
            native,
            policy,
        }
    }

    /// Queries every balance concurrently and waits until all finish or
    /// `deadline` passes.
    ///
    /// Token failures are recorded per symbol. Only a failed or unfinished
    /// native query fails the call, with `MandatoryQueryFailed`.
    pub async fn fetch_all(
        &self,
        account: &AccountAddress,
        tokens: &TokenSet,
        deadline: Instant,
    ) -> Result<BalanceFragments> {
        let chain: &dyn ChainQuery = self.chain.as_ref();
        let policy = &self.policy;
        let specs: Vec<_> = tokens.iter().collect();

        let mut pending: FuturesUnordered<SlotFuture<'_>> = FuturesUnordered::new();
        pending.push(Box::pin(async move {
            let result = retry_with_backoff(policy, "native balance", move || {
                chain.query_native_balance(account)
            })
            .await;
            (Slot::Native, result)
        }));
        for (index, spec) in specs.iter().copied().enumerate() {
            pending.push(Box::pin(async move {
                let label = format!("{} balance", spec.symbol);
                let result = retry_with_backoff(policy, &label, move || {
                    chain.query_token_balance(account, &spec.contract_address)
                })
                .await;
                (Slot::Token(index), result)
            }));
        }

        let mut native: Option<Result<U256>> = None;
        let mut token_results: BTreeMap<String, Result<BalanceEntry>> = BTreeMap::new();
        let mut deadline_elapsed = false;

        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((Slot::Native, result)) => native = Some(result),
                    Some((Slot::Token(index), result)) => {
                        let spec = specs[index];
                        let entry = result
                            .map(|raw| BalanceEntry::from_raw(&spec.symbol, raw, spec.decimals))
                            .map_err(|err| {
                                tracing::warn!(
                                    "{} balance for {} unavailable: {}",
                                    spec.symbol,
                                    account,
                                    err
                                );
                                AppError::QueryFailed {
                                    symbol: spec.symbol.clone(),
                                    reason: err.to_string(),
                                }
                            });
                        token_results.insert(spec.symbol.clone(), entry);
                    }
                    None => break,
                },
                _ = &mut expiry => {
                    deadline_elapsed = true;
                    break;
                }
            }
        }
        drop(pending);

        if deadline_elapsed {
            tracing::warn!(
                "Balance fetch for {} hit its deadline with {} of {} token queries done",
                account,
                token_results.len(),
                specs.len()
            );
            for spec in &specs {
                token_results
                    .entry(spec.symbol.clone())
                    .or_insert_with(|| {
                        Err(AppError::QueryFailed {
                            symbol: spec.symbol.clone(),
                            reason: DEADLINE_EXCEEDED.to_string(),
                        })
                    });
            }
        }

        let native_raw = match native {
            Some(Ok(raw)) => raw,
            Some(Err(err)) => return Err(AppError::MandatoryQueryFailed(err.to_string())),
            None => {
                return Err(AppError::MandatoryQueryFailed(
                    DEADLINE_EXCEEDED.to_string(),
                ))
            }
        };

        Ok(BalanceFragments {
            native: BalanceEntry::from_raw(&self.native.symbol, native_raw, self.native.decimals),
            tokens: token_results,
            deadline_elapsed,
        })
    }
}
