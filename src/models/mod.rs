// src/models/mod.rs
pub mod portfolio;
pub mod response;
pub mod session;

pub use portfolio::{
    AccountAddress,
    BalanceEntry,
    NativeCurrency,
    PortfolioSnapshot,
    SyncPayload,
    TokenSet,
    TokenSpec,
};
pub use response::ApiResponse;
pub use session::{
    FailureKind,
    PipelineStatus,
    SessionState,
    SessionStatus,
    SyncAttempt,
    SyncFailure,
    SyncOutcome,
};
