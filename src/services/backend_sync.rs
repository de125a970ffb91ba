use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use super::retry::RetryPolicy;
use crate::{
    config::Config,
    constants::{BACKEND_CONNECT_TIMEOUT_SECS, IDEMPOTENCY_KEY_HEADER},
    error::{AppError, Result},
    models::{
        AccountAddress, FailureKind, PortfolioSnapshot, SyncAttempt, SyncFailure, SyncOutcome,
        SyncPayload,
    },
};

/// Delivery of one portfolio payload to the backend.
///
/// Implementations classify failures as `SyncTransient` (network, timeout,
/// 5xx, 429) or `SyncRejected` (any other non-2xx).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn post_portfolio(&self, payload: &SyncPayload<'_>, idempotency_key: &str) -> Result<()>;
}

// ==================== HTTP TRANSPORT ====================

pub struct HttpSyncTransport {
    client: reqwest::Client,
    url: Url,
    auth_token: Option<String>,
}

impl HttpSyncTransport {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.backend_portfolio_url,
            config.backend_auth_token.clone(),
            config.backend_timeout(),
        )
    }

    pub fn new(url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| AppError::Config(format!("Invalid backend URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(BACKEND_CONNECT_TIMEOUT_SECS))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Backend HTTP client init failed: {}", e)))?;
        Ok(Self {
            client,
            url,
            auth_token,
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn post_portfolio(&self, payload: &SyncPayload<'_>, idempotency_key: &str) -> Result<()> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::SyncTransient(format!("Portfolio sync request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("HTTP {} {}", status.as_u16(), body.trim());
        if is_transient_status(status) {
            Err(AppError::SyncTransient(detail))
        } else {
            Err(AppError::SyncRejected(format!("rejected: {}", detail)))
        }
    }
}

// ==================== SYNC CLIENT ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncTicket {
    fetched_at: Option<DateTime<Utc>>,
    generation: u64,
}

struct AccountSync {
    latest: watch::Sender<SyncTicket>,
    acknowledged: Option<DateTime<Utc>>,
}

impl AccountSync {
    fn new() -> Self {
        let (latest, _) = watch::channel(SyncTicket {
            fetched_at: None,
            generation: 0,
        });
        Self {
            latest,
            acknowledged: None,
        }
    }
}

enum Registration {
    Live {
        generation: u64,
        updates: watch::Receiver<SyncTicket>,
    },
    Stale,
    AlreadyAcknowledged,
}

/// Backend Sync Client - pushes snapshots with retry, dedup and supersession
pub struct BackendSyncClient {
    transport: Arc<dyn SyncTransport>,
    policy: RetryPolicy,
    accounts: Mutex<HashMap<AccountAddress, AccountSync>>,
}

impl BackendSyncClient {
    pub fn new(transport: Arc<dyn SyncTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Delivers `snapshot`, retrying transient failures.
    ///
    /// Returns `Superseded` as soon as a newer snapshot for the same account
    /// is registered or the account is cancelled; the outcome of the
    /// superseded delivery is never reported.
    pub async fn sync(&self, snapshot: Arc<PortfolioSnapshot>) -> SyncOutcome {
        let account = snapshot.account;
        let (generation, mut updates) = match self.register(&snapshot) {
            Registration::Live {
                generation,
                updates,
            } => (generation, updates),
            Registration::Stale => {
                tracing::debug!(
                    "Dropping stale snapshot for {} fetched at {}",
                    account,
                    snapshot.fetched_at
                );
                return SyncOutcome::Superseded;
            }
            Registration::AlreadyAcknowledged => {
                tracing::debug!(
                    "Snapshot for {} fetched at {} already synced",
                    account,
                    snapshot.fetched_at
                );
                return SyncOutcome::Synced;
            }
        };

        let key = snapshot.idempotency_key();
        let payload = snapshot.payload();
        let mut attempt = SyncAttempt::new(snapshot.clone());

        loop {
            attempt.attempt_count += 1;
            let result = tokio::select! {
                biased;
                _ = superseded(&mut updates, generation) => return self.abandon(&attempt),
                result = self.transport.post_portfolio(&payload, &key) => result,
            };

            match result {
                Ok(()) => {
                    if !self.acknowledge(&account, generation, snapshot.fetched_at) {
                        return self.abandon(&attempt);
                    }
                    tracing::info!(
                        "Portfolio for {} synced (fetched_at={}, attempts={})",
                        account,
                        snapshot.fetched_at,
                        attempt.attempt_count
                    );
                    return SyncOutcome::Synced;
                }
                Err(err) if err.is_retryable() && attempt.attempt_count < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt.attempt_count - 1);
                    tracing::debug!(
                        "Portfolio sync for {} failed (attempt {}/{}): {}; retrying in {}ms",
                        account,
                        attempt.attempt_count,
                        self.policy.max_attempts,
                        err,
                        delay.as_millis()
                    );
                    attempt.last_error = Some(err);
                    tokio::select! {
                        biased;
                        _ = superseded(&mut updates, generation) => return self.abandon(&attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    let kind = match err {
                        AppError::SyncRejected(_) => FailureKind::SyncRejected,
                        _ => FailureKind::SyncExhausted,
                    };
                    tracing::error!(
                        "Portfolio sync for {} failed after {} attempt(s): {}",
                        account,
                        attempt.attempt_count,
                        err
                    );
                    return SyncOutcome::Failed(SyncFailure {
                        kind,
                        reason: err.to_string(),
                        attempts: attempt.attempt_count,
                    });
                }
            }
        }
    }

    /// Supersedes whatever is in flight for `account` without registering a
    /// new snapshot. Used on disconnect and account switch.
    ///
    /// Accounts with no registered sync left are forgotten, so the map only
    /// holds accounts still being delivered.
    pub fn cancel_account(&self, account: &AccountAddress) {
        let mut accounts = self.lock_accounts();
        if let Some(state) = accounts.get(account) {
            state.latest.send_modify(|ticket| ticket.generation += 1);
            tracing::debug!("Cancelled in-flight sync for {}", account);
        }
        accounts.retain(|_, state| state.latest.receiver_count() > 0);
    }

    fn register(&self, snapshot: &PortfolioSnapshot) -> Registration {
        let mut accounts = self.lock_accounts();
        let state = accounts
            .entry(snapshot.account)
            .or_insert_with(AccountSync::new);

        if state.acknowledged == Some(snapshot.fetched_at) {
            return Registration::AlreadyAcknowledged;
        }
        let current = *state.latest.borrow();
        if matches!(current.fetched_at, Some(latest) if latest > snapshot.fetched_at) {
            return Registration::Stale;
        }
        if matches!(state.acknowledged, Some(acked) if acked > snapshot.fetched_at) {
            return Registration::Stale;
        }

        let generation = current.generation + 1;
        state.latest.send_replace(SyncTicket {
            fetched_at: Some(snapshot.fetched_at),
            generation,
        });
        Registration::Live {
            generation,
            updates: state.latest.subscribe(),
        }
    }

    fn acknowledge(
        &self,
        account: &AccountAddress,
        generation: u64,
        fetched_at: DateTime<Utc>,
    ) -> bool {
        let mut accounts = self.lock_accounts();
        let Some(state) = accounts.get_mut(account) else {
            return false;
        };
        if state.latest.borrow().generation != generation {
            return false;
        }
        state.acknowledged = Some(fetched_at);
        true
    }

    fn abandon(&self, attempt: &SyncAttempt) -> SyncOutcome {
        tracing::debug!(
            "Sync for {} fetched at {} abandoned after {} attempt(s) (last error: {:?}): {}",
            attempt.snapshot.account,
            attempt.snapshot.fetched_at,
            attempt.attempt_count,
            attempt.last_error,
            AppError::Superseded
        );
        SyncOutcome::Superseded
    }

    fn lock_accounts(&self) -> std::sync::MutexGuard<'_, HashMap<AccountAddress, AccountSync>> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves once the account's ticket moves past `generation`.
async fn superseded(updates: &mut watch::Receiver<SyncTicket>, generation: u64) {
    let closed = updates
        .wait_for(|ticket| ticket.generation != generation)
        .await
        .is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use std::collections::HashSet;

    fn client(transport: Arc<RecordingTransport>) -> BackendSyncClient {
        BackendSyncClient::new(transport, RetryPolicy::backend_sync())
    }

    #[tokio::test(start_paused = true)]
    async fn successful_sync_posts_once() {
        let transport = Arc::new(RecordingTransport::default());
        let client = client(transport.clone());
        let snap = Arc::new(snapshot(addr(ALICE), at_millis(1_000)));

        assert_eq!(client.sync(snap.clone()).await, SyncOutcome::Synced);

        let posts = transport.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].idempotency_key, snap.idempotency_key());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_up_to_three_attempts() {
        let transport = Arc::new(RecordingTransport::scripted(vec![
            Err(AppError::SyncTransient("HTTP 503".into())),
            Err(AppError::SyncTransient("HTTP 502".into())),
            Err(AppError::SyncTransient("HTTP 500".into())),
            Ok(()),
        ]));
        let client = client(transport.clone());
        let started = tokio::time::Instant::now();

        let outcome = client
            .sync(Arc::new(snapshot(addr(ALICE), at_millis(1_000))))
            .await;

        match outcome {
            SyncOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::SyncExhausted);
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(transport.posts().len(), 3);
        // 500ms + 1000ms of backoff between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_500));
        assert!(elapsed < Duration::from_millis(1_600));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let transport = Arc::new(RecordingTransport::scripted(vec![Err(
            AppError::SyncTransient("timeout".into()),
        )]));
        let client = client(transport.clone());

        let outcome = client
            .sync(Arc::new(snapshot(addr(ALICE), at_millis(1_000))))
            .await;

        assert_eq!(outcome, SyncOutcome::Synced);
        let keys: HashSet<_> = transport
            .posts()
            .into_iter()
            .map(|post| post.idempotency_key)
            .collect();
        assert_eq!(transport.posts().len(), 2);
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let transport = Arc::new(RecordingTransport::scripted(vec![Err(
            AppError::SyncRejected("rejected: HTTP 422".into()),
        )]));
        let client = client(transport.clone());

        let outcome = client
            .sync(Arc::new(snapshot(addr(ALICE), at_millis(1_000))))
            .await;

        assert!(matches!(
            outcome,
            SyncOutcome::Failed(SyncFailure { kind: FailureKind::SyncRejected, attempts: 1, .. })
        ));
        assert_eq!(transport.posts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_snapshot_supersedes_retrying_sync() {
        let transport = Arc::new(RecordingTransport::scripted(vec![Err(
            AppError::SyncTransient("HTTP 503".into()),
        )]));
        let client = Arc::new(client(transport.clone()));
        let alice = addr(ALICE);

        let older = {
            let client = client.clone();
            tokio::spawn(async move { client.sync(Arc::new(snapshot(alice, at_millis(1_000)))).await })
        };
        // first attempt fails; the older sync is now backing off
        tokio::time::sleep(Duration::from_millis(100)).await;

        let newer = client.sync(Arc::new(snapshot(alice, at_millis(2_000)))).await;

        assert_eq!(newer, SyncOutcome::Synced);
        assert_eq!(older.await.unwrap(), SyncOutcome::Superseded);
        let fetched: Vec<_> = transport.posts().into_iter().map(|p| p.fetched_at).collect();
        assert_eq!(fetched, vec![at_millis(1_000), at_millis(2_000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_is_never_posted() {
        let transport = Arc::new(RecordingTransport::default());
        let client = client(transport.clone());
        let alice = addr(ALICE);

        assert_eq!(
            client.sync(Arc::new(snapshot(alice, at_millis(2_000)))).await,
            SyncOutcome::Synced
        );
        assert_eq!(
            client.sync(Arc::new(snapshot(alice, at_millis(1_000)))).await,
            SyncOutcome::Superseded
        );
        assert_eq!(transport.posts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_of_acknowledged_snapshot_is_local_noop() {
        let transport = Arc::new(RecordingTransport::default());
        let client = client(transport.clone());
        let snap = Arc::new(snapshot(addr(ALICE), at_millis(1_000)));

        assert_eq!(client.sync(snap.clone()).await, SyncOutcome::Synced);
        assert_eq!(client.sync(snap).await, SyncOutcome::Synced);
        assert_eq!(transport.posts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_account_supersedes_in_flight_post() {
        let transport =
            Arc::new(RecordingTransport::default().with_delay(Duration::from_secs(5)));
        let client = Arc::new(client(transport.clone()));
        let alice = addr(ALICE);

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.sync(Arc::new(snapshot(alice, at_millis(1_000)))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.cancel_account(&alice);

        assert_eq!(pending.await.unwrap(), SyncOutcome::Superseded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_forgets_idle_accounts() {
        let transport = Arc::new(RecordingTransport::default());
        let client = client(transport.clone());

        for (i, raw) in [ALICE, BOB].into_iter().enumerate() {
            let snap = Arc::new(snapshot(addr(raw), at_millis(1_000 + i as i64)));
            assert_eq!(client.sync(snap).await, SyncOutcome::Synced);
        }
        assert_eq!(client.accounts.lock().unwrap().len(), 2);

        client.cancel_account(&addr(ALICE));
        assert!(client.accounts.lock().unwrap().is_empty());

        // A forgotten account syncs again from scratch
        let again = Arc::new(snapshot(addr(ALICE), at_millis(3_000)));
        assert_eq!(client.sync(again).await, SyncOutcome::Synced);
        assert_eq!(transport.posts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_accounts_with_sync_in_flight() {
        let transport =
            Arc::new(RecordingTransport::default().with_delay(Duration::from_secs(5)));
        let client = Arc::new(client(transport.clone()));
        let bob = addr(BOB);

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.sync(Arc::new(snapshot(bob, at_millis(1_000)))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.cancel_account(&addr(ALICE));

        assert!(client.accounts.lock().unwrap().contains_key(&bob));
        assert_eq!(pending.await.unwrap(), SyncOutcome::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn accounts_do_not_supersede_each_other() {
        let transport =
            Arc::new(RecordingTransport::default().with_delay(Duration::from_millis(50)));
        let client = Arc::new(client(transport.clone()));

        let alice = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .sync(Arc::new(snapshot(addr(ALICE), at_millis(1_000))))
                    .await
            })
        };
        let bob = client.sync(Arc::new(snapshot(addr(BOB), at_millis(2_000)))).await;

        assert_eq!(bob, SyncOutcome::Synced);
        assert_eq!(alice.await.unwrap(), SyncOutcome::Synced);
    }

    // ==================== HTTP ====================

    #[derive(Clone, Default)]
    struct MockBackend {
        status: Arc<Mutex<StatusCode>>,
        posts: Arc<Mutex<Vec<String>>>,
        applied: Arc<Mutex<HashSet<String>>>,
        bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    async fn receive(
        State(backend): State<MockBackend>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let key = headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let status = *backend.status.lock().unwrap();
        backend.posts.lock().unwrap().push(key.clone());
        backend.bodies.lock().unwrap().push(body);
        if status.is_success() {
            backend.applied.lock().unwrap().insert(key);
        }
        status
    }

    async fn spawn_backend(status: StatusCode) -> (MockBackend, String) {
        let backend = MockBackend::default();
        *backend.status.lock().unwrap() = status;
        let app = Router::new()
            .route("/api/create_portfolio/", post(receive))
            .with_state(backend.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (backend, format!("http://{}/api/create_portfolio/", addr))
    }

    fn http_transport(url: &str) -> Arc<HttpSyncTransport> {
        Arc::new(HttpSyncTransport::new(url, None, Duration::from_secs(5)).unwrap())
    }

    #[tokio::test]
    async fn http_transport_posts_camel_case_payload_with_key() {
        let (backend, url) = spawn_backend(StatusCode::CREATED).await;
        let transport = http_transport(&url);
        let snap = snapshot(addr(ALICE), at_millis(1_700_000_000_000));

        transport
            .post_portfolio(&snap.payload(), &snap.idempotency_key())
            .await
            .unwrap();

        let bodies = backend.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["account"], ALICE);
        assert_eq!(bodies[0]["nativeBalance"]["symbol"], "ETH");
        assert_eq!(bodies[0]["partial"], false);
        assert!(bodies[0]["tokenBalances"].is_object());
        assert_eq!(backend.posts.lock().unwrap()[0], snap.idempotency_key());
    }

    #[tokio::test]
    async fn http_transport_classifies_statuses() {
        let snap = snapshot(addr(ALICE), at_millis(1_000));

        let (_, url) = spawn_backend(StatusCode::UNPROCESSABLE_ENTITY).await;
        let rejected = http_transport(&url)
            .post_portfolio(&snap.payload(), &snap.idempotency_key())
            .await;
        assert!(matches!(rejected, Err(AppError::SyncRejected(ref reason)) if reason.starts_with("rejected")));

        let (_, url) = spawn_backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let transient = http_transport(&url)
            .post_portfolio(&snap.payload(), &snap.idempotency_key())
            .await;
        assert!(matches!(transient, Err(AppError::SyncTransient(_))));
    }

    #[tokio::test]
    async fn unreachable_backend_is_transient() {
        let transport = http_transport("http://127.0.0.1:9/api/create_portfolio/");
        let snap = snapshot(addr(ALICE), at_millis(1_000));
        let result = transport
            .post_portfolio(&snap.payload(), &snap.idempotency_key())
            .await;
        assert!(matches!(result, Err(AppError::SyncTransient(_))));
    }

    #[tokio::test]
    async fn duplicate_syncs_apply_once_at_backend() {
        let (backend, url) = spawn_backend(StatusCode::OK).await;
        let client = Arc::new(BackendSyncClient::new(
            http_transport(&url),
            RetryPolicy::backend_sync(),
        ));
        let snap = Arc::new(snapshot(addr(ALICE), at_millis(1_000)));

        let (first, second) = tokio::join!(client.sync(snap.clone()), client.sync(snap.clone()));
        let third = client.sync(snap.clone()).await;

        let outcomes = [first, second, third];
        assert!(outcomes.contains(&SyncOutcome::Synced));
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, SyncOutcome::Synced | SyncOutcome::Superseded)));
        assert_eq!(backend.applied.lock().unwrap().len(), 1);
        assert!(backend.posts.lock().unwrap().len() <= 2);
    }
}
