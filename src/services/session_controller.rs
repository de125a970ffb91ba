use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::backend_sync::BackendSyncClient;
use super::balance_fetcher::ChainBalanceFetcher;
use super::reconciler::PortfolioReconciler;
use crate::{
    constants::{SESSION_EVENT_BUFFER, SESSION_TRANSITION_BUFFER},
    error::{AppError, Result},
    models::{
        AccountAddress, FailureKind, PipelineStatus, PortfolioSnapshot, SessionState,
        SessionStatus, SyncOutcome, TokenSet,
    },
};

/// Notifications from the wallet provider, plus manual refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    ConnectRequested,
    AccountReported(AccountAddress),
    Disconnected,
    ProviderError(String),
    RefreshRequested,
}

/// Collaborators a pipeline run needs. Shared by every run of a session.
pub struct PipelineDeps {
    pub fetcher: Arc<ChainBalanceFetcher>,
    pub reconciler: PortfolioReconciler,
    pub sync: Arc<BackendSyncClient>,
    pub tokens: TokenSet,
    pub fetch_deadline: Duration,
}

#[derive(Debug)]
enum PipelineResult {
    FetchFailed(AppError),
    Synced {
        outcome: SyncOutcome,
        fetched_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
enum Message {
    Provider(ProviderEvent),
    SnapshotReady {
        run: u64,
        snapshot: Arc<PortfolioSnapshot>,
    },
    PipelineFinished {
        run: u64,
        account: AccountAddress,
        result: PipelineResult,
    },
}

// ==================== HANDLE ====================

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<Message>,
    status: watch::Receiver<SessionStatus>,
    transitions: broadcast::Sender<SessionState>,
}

impl SessionHandle {
    pub async fn send(&self, event: ProviderEvent) -> Result<()> {
        self.events
            .send(Message::Provider(event))
            .await
            .map_err(|_| AppError::SessionClosed)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Every state the session enters, including short-lived `Switching`.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }
}

// ==================== CONTROLLER ====================

struct LiveRun {
    id: u64,
    account: AccountAddress,
    task: JoinHandle<()>,
}

/// Wallet Session Controller - owns the session state and drives
/// fetch, reconcile and sync for the connected account
pub struct WalletSessionController {
    deps: Arc<PipelineDeps>,
    inbox: mpsc::Receiver<Message>,
    outbox: mpsc::WeakSender<Message>,
    status: watch::Sender<SessionStatus>,
    transitions: broadcast::Sender<SessionState>,
    live: Option<LiveRun>,
    next_run: u64,
}

impl WalletSessionController {
    /// Starts the event loop on the current runtime. The loop stops once
    /// every `SessionHandle` is dropped.
    pub fn spawn(deps: PipelineDeps) -> SessionHandle {
        let (events, inbox) = mpsc::channel(SESSION_EVENT_BUFFER);
        let (status, status_rx) = watch::channel(SessionStatus::default());
        let (transitions, _) = broadcast::channel(SESSION_TRANSITION_BUFFER);

        let controller = Self {
            deps: Arc::new(deps),
            inbox,
            outbox: events.downgrade(),
            status,
            transitions: transitions.clone(),
            live: None,
            next_run: 0,
        };
        tokio::spawn(controller.run());

        SessionHandle {
            events,
            status: status_rx,
            transitions,
        }
    }

    async fn run(mut self) {
        tracing::info!("Wallet session controller started");
        while let Some(message) = self.inbox.recv().await {
            match message {
                Message::Provider(event) => self.handle_event(event),
                Message::SnapshotReady { run, snapshot } => self.on_snapshot(run, snapshot),
                Message::PipelineFinished {
                    run,
                    account,
                    result,
                } => self.on_finished(run, account, result),
            }
        }
        self.cancel_live();
        tracing::info!("Wallet session controller stopped");
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state.clone()
    }

    fn handle_event(&mut self, event: ProviderEvent) {
        let current = self.state();
        tracing::debug!("Provider event {:?} in state {}", event, current.label());

        match (current, event) {
            (
                SessionState::Disconnected | SessionState::Error { .. },
                ProviderEvent::ConnectRequested,
            ) => {
                self.enter(SessionState::Connecting);
            }
            (_, ProviderEvent::ConnectRequested) => {
                tracing::debug!("Connect requested while already connecting or connected");
            }

            (SessionState::Connected { account }, ProviderEvent::AccountReported(reported))
                if account == reported =>
            {
                tracing::debug!("Account {} re-reported; nothing to do", account);
            }
            (SessionState::Connected { account: from }, ProviderEvent::AccountReported(to)) => {
                tracing::info!("Wallet switched from {} to {}", from, to);
                self.cancel_live();
                self.enter(SessionState::Switching { from, to });
                self.status.send_modify(|status| {
                    status.snapshot = None;
                    status.last_error = None;
                });
                self.connect(to);
            }
            (SessionState::Connecting, ProviderEvent::AccountReported(account)) => {
                self.connect(account);
            }
            (_, ProviderEvent::AccountReported(account)) => {
                // Providers may report an account without a prior connect request
                self.enter(SessionState::Connecting);
                self.status.send_modify(|status| {
                    status.snapshot = None;
                    status.last_error = None;
                });
                self.connect(account);
            }

            (SessionState::Disconnected, ProviderEvent::Disconnected) => {}
            (_, ProviderEvent::Disconnected) => {
                self.cancel_live();
                self.status.send_modify(|status| {
                    status.pipeline = PipelineStatus::Idle;
                    status.snapshot = None;
                    status.last_error = None;
                });
                self.enter(SessionState::Disconnected);
            }

            (_, ProviderEvent::ProviderError(reason)) => {
                tracing::warn!("Wallet provider error: {}", reason);
                self.cancel_live();
                self.status.send_modify(|status| {
                    status.pipeline = PipelineStatus::Idle;
                    status.last_error = Some(reason.clone());
                });
                self.enter(SessionState::Error { reason });
            }

            (SessionState::Connected { account }, ProviderEvent::RefreshRequested) => {
                tracing::debug!("Refreshing portfolio for {}", account);
                self.start_pipeline(account);
            }
            (state, ProviderEvent::RefreshRequested) => {
                tracing::debug!("Refresh ignored in state {}", state.label());
            }
        }
    }

    fn connect(&mut self, account: AccountAddress) {
        // A snapshot kept through a provider error may belong to another account
        self.status.send_if_modified(|status| {
            let foreign = matches!(&status.snapshot, Some(snapshot) if snapshot.account != account);
            if foreign {
                status.snapshot = None;
            }
            foreign
        });
        self.enter(SessionState::Connected { account });
        self.start_pipeline(account);
    }

    fn enter(&mut self, state: SessionState) {
        self.status.send_modify(|status| status.state = state.clone());
        // No subscribers is fine
        let _ = self.transitions.send(state);
    }

    fn start_pipeline(&mut self, account: AccountAddress) {
        self.cancel_live();
        self.next_run += 1;
        let run = self.next_run;

        let task = tokio::spawn(run_pipeline(
            self.deps.clone(),
            run,
            account,
            self.outbox.clone(),
        ));
        self.live = Some(LiveRun { id: run, account, task });
        self.status
            .send_modify(|status| status.pipeline = PipelineStatus::Fetching { account });
    }

    fn cancel_live(&mut self) {
        if let Some(live) = self.live.take() {
            tracing::debug!("Cancelling pipeline run {} for {}", live.id, live.account);
            live.task.abort();
            self.deps.sync.cancel_account(&live.account);
        }
    }

    fn is_live(&self, run: u64) -> bool {
        matches!(&self.live, Some(live) if live.id == run)
    }

    fn on_snapshot(&mut self, run: u64, snapshot: Arc<PortfolioSnapshot>) {
        if !self.is_live(run) {
            tracing::debug!("Discarding snapshot from superseded run {}", run);
            return;
        }
        self.status.send_modify(|status| {
            let keep = match &status.snapshot {
                Some(current) if current.account == snapshot.account => {
                    PortfolioReconciler::newest(current, &snapshot).clone()
                }
                _ => snapshot.clone(),
            };
            status.snapshot = Some(keep);
            status.pipeline = PipelineStatus::Syncing {
                account: snapshot.account,
                fetched_at: snapshot.fetched_at,
            };
        });
    }

    fn on_finished(&mut self, run: u64, account: AccountAddress, result: PipelineResult) {
        if !self.is_live(run) {
            tracing::debug!("Discarding result of superseded run {} for {}", run, account);
            return;
        }
        self.live = None;

        match result {
            PipelineResult::FetchFailed(err) => {
                tracing::warn!("Portfolio fetch for {} failed: {}", account, err);
                self.fail(account, FailureKind::MandatoryQueryFailed, err.to_string());
            }
            PipelineResult::Synced {
                outcome: SyncOutcome::Synced,
                fetched_at,
            } => {
                self.status.send_modify(|status| {
                    status.pipeline = PipelineStatus::Synced { account, fetched_at };
                    status.last_error = None;
                });
            }
            PipelineResult::Synced {
                outcome: SyncOutcome::Failed(failure),
                ..
            } => {
                self.fail(account, failure.kind, failure.reason);
            }
            PipelineResult::Synced {
                outcome: SyncOutcome::Superseded,
                ..
            } => {
                tracing::debug!("Sync for {} superseded outside the session", account);
                self.status.send_modify(|status| status.pipeline = PipelineStatus::Idle);
            }
        }
    }

    fn fail(&mut self, account: AccountAddress, kind: FailureKind, reason: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(reason.clone());
            status.pipeline = PipelineStatus::Failed {
                account,
                kind,
                reason,
            };
        });
    }
}

async fn run_pipeline(
    deps: Arc<PipelineDeps>,
    run: u64,
    account: AccountAddress,
    outbox: mpsc::WeakSender<Message>,
) {
    let deadline = tokio::time::Instant::now() + deps.fetch_deadline;
    let fragments = match deps.fetcher.fetch_all(&account, &deps.tokens, deadline).await {
        Ok(fragments) => fragments,
        Err(err) => {
            report(
                &outbox,
                Message::PipelineFinished {
                    run,
                    account,
                    result: PipelineResult::FetchFailed(err),
                },
            )
            .await;
            return;
        }
    };

    let snapshot = Arc::new(deps.reconciler.reconcile(account, fragments));
    if snapshot.partial {
        tracing::warn!(
            "Partial portfolio for {}: missing {:?}",
            account,
            snapshot.missing.keys().collect::<Vec<_>>()
        );
    }
    report(
        &outbox,
        Message::SnapshotReady {
            run,
            snapshot: snapshot.clone(),
        },
    )
    .await;

    let fetched_at = snapshot.fetched_at;
    let outcome = deps.sync.sync(snapshot).await;
    report(
        &outbox,
        Message::PipelineFinished {
            run,
            account,
            result: PipelineResult::Synced {
                outcome,
                fetched_at,
            },
        },
    )
    .await;
}

async fn report(outbox: &mpsc::WeakSender<Message>, message: Message) {
    if let Some(sender) = outbox.upgrade() {
        let _ = sender.send(message).await;
    }
}
