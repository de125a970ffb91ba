use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::portfolio::{AccountAddress, PortfolioSnapshot};
use crate::error::AppError;

// ==================== SESSION STATE ====================

/// Connection state of the single wallet session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected {
        account: AccountAddress,
    },
    Switching {
        from: AccountAddress,
        to: AccountAddress,
    },
    Error {
        reason: String,
    },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected { .. } => "connected",
            SessionState::Switching { .. } => "switching",
            SessionState::Error { .. } => "error",
        }
    }

    pub fn account(&self) -> Option<AccountAddress> {
        match self {
            SessionState::Connected { account } => Some(*account),
            SessionState::Switching { to, .. } => Some(*to),
            _ => None,
        }
    }
}

// ==================== PIPELINE STATUS ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MandatoryQueryFailed,
    SyncRejected,
    SyncExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Fetching {
        account: AccountAddress,
    },
    Syncing {
        account: AccountAddress,
        fetched_at: DateTime<Utc>,
    },
    Synced {
        account: AccountAddress,
        fetched_at: DateTime<Utc>,
    },
    Failed {
        account: AccountAddress,
        kind: FailureKind,
        reason: String,
    },
}

/// Everything an observer of the session can see.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub pipeline: PipelineStatus,
    /// Last-known-good snapshot for the current account.
    pub snapshot: Option<Arc<PortfolioSnapshot>>,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            pipeline: PipelineStatus::Idle,
            snapshot: None,
            last_error: None,
        }
    }
}

// ==================== SYNC ====================

/// One snapshot's trip through the retry loop. Dropped on success or supersession.
#[derive(Debug, Clone)]
pub struct SyncAttempt {
    pub snapshot: Arc<PortfolioSnapshot>,
    pub attempt_count: u32,
    pub last_error: Option<AppError>,
}

impl SyncAttempt {
    pub fn new(snapshot: Arc<PortfolioSnapshot>) -> Self {
        Self {
            snapshot,
            attempt_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    Failed(SyncFailure),
    /// A newer snapshot for the same account took over. Not a failure.
    Superseded,
}
