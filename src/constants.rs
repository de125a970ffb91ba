/// Application constants

// Native currency
pub const DEFAULT_NATIVE_SYMBOL: &str = "ETH";
pub const DEFAULT_NATIVE_DECIMALS: u8 = 18;

// Token list used when TOKEN_CONFIG is unset (Ethereum mainnet)
pub const DEFAULT_TOKEN_CONFIG: &str = "USDT:0xdAC17F958D2ee523a2206206994597C13D831ec7:6,\
DAI:0x6B175474E89094C44Da98b954EedeAC495271d0F:18,\
LINK:0x514910771AF9Ca656af840dff83E8264EcF986CA:18";

// 10^78 does not fit in a uint256
pub const MAX_TOKEN_DECIMALS: u8 = 77;

// Balance query retry policy
pub const BALANCE_QUERY_MAX_ATTEMPTS: u32 = 2;
pub const BALANCE_QUERY_BASE_DELAY_MS: u64 = 300;
pub const BALANCE_QUERY_JITTER: f64 = 0.2;

// Backend sync retry policy
pub const SYNC_MAX_ATTEMPTS: u32 = 3;
pub const SYNC_BASE_DELAY_MS: u64 = 500;
pub const SYNC_MAX_DELAY_MS: u64 = 5_000;

pub const BACKOFF_FACTOR: u32 = 2;

// Backend endpoint
pub const DEFAULT_BACKEND_PORTFOLIO_URL: &str = "http://127.0.0.1:8000/api/create_portfolio/";
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 10;
pub const BACKEND_CONNECT_TIMEOUT_SECS: u64 = 4;
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

// Chain queries
pub const DEFAULT_FETCH_DEADLINE_MS: u64 = 10_000;
pub const EVM_RPC_MAX_INFLIGHT_DEFAULT: usize = 8;

// Session
pub const SESSION_EVENT_BUFFER: usize = 64;
pub const SESSION_TRANSITION_BUFFER: usize = 64;

// API version
pub const API_VERSION: &str = "v1";
