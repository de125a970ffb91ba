// All service modules
pub mod backend_sync;
pub mod balance_fetcher;
pub mod chain_query;
pub mod reconciler;
pub mod retry;
pub mod session_controller;

#[cfg(test)]
pub mod testing;

// Re-export for convenience
pub use backend_sync::{BackendSyncClient, HttpSyncTransport, SyncTransport};
pub use balance_fetcher::ChainBalanceFetcher;
pub use chain_query::{ChainQuery, EvmChainQuery};
pub use reconciler::PortfolioReconciler;
pub use retry::RetryPolicy;
pub use session_controller::{PipelineDeps, ProviderEvent, SessionHandle, WalletSessionController};

use crate::{
    config::Config,
    error::Result,
    models::{PipelineStatus, SessionState},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

/// Wires the production collaborators and starts the session controller.
pub fn start_session(config: &Config) -> Result<SessionHandle> {
    let chain: Arc<dyn ChainQuery> = Arc::new(EvmChainQuery::from_config(config)?);
    let transport: Arc<dyn SyncTransport> = Arc::new(HttpSyncTransport::from_config(config)?);

    Ok(WalletSessionController::spawn(PipelineDeps {
        fetcher: Arc::new(ChainBalanceFetcher::new(
            chain,
            config.native_currency(),
            RetryPolicy::balance_query(),
        )),
        reconciler: PortfolioReconciler::new(),
        sync: Arc::new(BackendSyncClient::new(transport, RetryPolicy::backend_sync())),
        tokens: config.tokens.clone(),
        fetch_deadline: config.fetch_deadline(),
    }))
}

/// Start all background services
pub async fn start_background_services(session: SessionHandle, config: Config) {
    tracing::info!("Starting background services...");

    if let Some(account) = config.watch_wallet_address {
        tracing::info!("Watching wallet {}", account);
        if let Err(e) = session.send(ProviderEvent::ConnectRequested).await {
            tracing::error!("Failed to connect watched wallet: {}", e);
        }
        if let Err(e) = session.send(ProviderEvent::AccountReported(account)).await {
            tracing::error!("Failed to report watched wallet: {}", e);
        }
    }

    start_activity_log(session.clone());

    if config.refresh_interval_secs > 0 {
        start_refresh_loop(session, Duration::from_secs(config.refresh_interval_secs));
    } else {
        tracing::info!("Periodic refresh disabled (REFRESH_INTERVAL_SECS=0)");
    }

    tracing::info!("All background services started successfully");
}

/// Logs every session transition and pipeline outcome until the session closes.
pub fn start_activity_log(session: SessionHandle) -> tokio::task::JoinHandle<()> {
    let mut transitions = session.subscribe_transitions();
    let mut status = session.watch_status();
    drop(session);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                transition = transitions.recv() => match transition {
                    Ok(SessionState::Connected { account }) => {
                        tracing::info!("Session connected to {}", account);
                    }
                    Ok(SessionState::Switching { from, to }) => {
                        tracing::info!("Session switching {} -> {}", from, to);
                    }
                    Ok(SessionState::Error { reason }) => {
                        tracing::warn!("Session error: {}", reason);
                    }
                    Ok(state) => tracing::info!("Session {}", state.label()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Activity log skipped {} transitions", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let pipeline = status.borrow_and_update().pipeline.clone();
                    match pipeline {
                        PipelineStatus::Synced { account, fetched_at } => {
                            tracing::debug!("Pipeline for {} settled at {}", account, fetched_at);
                        }
                        PipelineStatus::Failed { account, kind, reason } => {
                            tracing::warn!("Pipeline for {} failed ({:?}): {}", account, kind, reason);
                        }
                        _ => {}
                    }
                }
            }
        }
    })
}

/// Emits `RefreshRequested` every `period` until the session closes.
pub fn start_refresh_loop(session: SessionHandle, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if session.send(ProviderEvent::RefreshRequested).await.is_err() {
                tracing::debug!("Session closed; stopping refresh loop");
                break;
            }
        }
    })
}
