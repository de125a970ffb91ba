use chrono::{DateTime, Utc};
use ethers::{types::Address, types::U256, utils::to_checksum};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::{
    amount::{parse_human_amount, to_human_amount, u256_decimal},
    constants::MAX_TOKEN_DECIMALS,
    crypto::hash::idempotency_key,
    error::{AppError, Result},
};

// ==================== ACCOUNT ADDRESS ====================

/// EVM account or contract address.
///
/// Identity is the 20 address bytes, so `0xabc…` and `0xABC…` compare equal.
/// Always displayed in EIP-55 checksum form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountAddress(Address);

impl AccountAddress {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim();
        if !is_valid_evm_address(normalized) {
            return Err(AppError::InvalidAddress(format!(
                "{} (expected 0x + 40 hex chars)",
                normalized
            )));
        }
        normalized
            .parse::<Address>()
            .map(Self)
            .map_err(|e| AppError::InvalidAddress(format!("{}: {}", normalized, e)))
    }

    pub fn as_address(&self) -> Address {
        self.0
    }

    pub fn checksummed(&self) -> String {
        to_checksum(&self.0, None)
    }
}

fn is_valid_evm_address(value: &str) -> bool {
    value.starts_with("0x") && value.len() == 42 && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksummed())
    }
}

impl fmt::Debug for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountAddress({})", self.checksummed())
    }
}

impl Serialize for AccountAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.checksummed())
    }
}

// ==================== TOKEN CONFIGURATION ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSpec {
    pub symbol: String,
    pub contract_address: AccountAddress,
    pub decimals: u8,
}

impl TokenSpec {
    pub fn new(symbol: &str, contract_address: &str, decimals: u8) -> Result<Self> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(AppError::Config("Token symbol is empty".to_string()));
        }
        if decimals > MAX_TOKEN_DECIMALS {
            return Err(AppError::Config(format!(
                "Token {} has {} decimals (max {})",
                symbol, decimals, MAX_TOKEN_DECIMALS
            )));
        }
        Ok(Self {
            symbol: symbol.to_string(),
            contract_address: AccountAddress::parse(contract_address)?,
            decimals,
        })
    }
}

/// Immutable token list loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    specs: Arc<[TokenSpec]>,
}

impl TokenSet {
    pub fn new(specs: Vec<TokenSpec>) -> Result<Self> {
        let mut contracts = HashSet::new();
        let mut symbols = HashSet::new();
        for spec in &specs {
            if !contracts.insert(spec.contract_address) {
                return Err(AppError::Config(format!(
                    "Duplicate token contract {}",
                    spec.contract_address
                )));
            }
            if !symbols.insert(spec.symbol.to_ascii_uppercase()) {
                return Err(AppError::Config(format!(
                    "Duplicate token symbol {}",
                    spec.symbol
                )));
            }
        }
        Ok(Self {
            specs: specs.into(),
        })
    }

    /// Parses `SYMBOL:0xcontract:decimals` entries separated by commas,
    /// semicolons or whitespace.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut specs = Vec::new();
        for entry in raw
            .split([',', ';', '\n', '\r', ' '])
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [symbol, contract, decimals] = parts.as_slice() else {
                return Err(AppError::Config(format!(
                    "Invalid token entry '{}' (expected SYMBOL:0xcontract:decimals)",
                    entry
                )));
            };
            let decimals = decimals.parse::<u8>().map_err(|e| {
                AppError::Config(format!("Invalid decimals in '{}': {}", entry, e))
            })?;
            specs.push(TokenSpec::new(symbol, contract, decimals)?);
        }
        Self::new(specs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenSpec> {
        self.specs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.specs.iter().map(|spec| spec.symbol.as_str()).collect()
    }
}

/// Native currency of the chain the wallet is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCurrency {
    pub symbol: String,
    pub decimals: u8,
}

// ==================== BALANCES ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub symbol: String,
    #[serde(serialize_with = "u256_decimal::serialize")]
    pub raw_amount: U256,
    pub human_amount: String,
}

impl BalanceEntry {
    pub fn from_raw(symbol: &str, raw_amount: U256, decimals: u8) -> Self {
        let human_amount = to_human_amount(raw_amount, decimals);
        debug_assert_eq!(
            parse_human_amount(&human_amount, decimals).ok(),
            Some(raw_amount)
        );
        Self {
            symbol: symbol.to_string(),
            raw_amount,
            human_amount,
        }
    }
}

// ==================== SNAPSHOT ====================

/// Point-in-time portfolio for one account. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub account: AccountAddress,
    pub native_balance: BalanceEntry,
    pub token_balances: BTreeMap<String, BalanceEntry>,
    pub fetched_at: DateTime<Utc>,
    /// Set iff at least one token query failed or missed the deadline.
    pub partial: bool,
    /// Symbol -> failure reason for every token absent from `token_balances`.
    pub missing: BTreeMap<String, String>,
}

impl PortfolioSnapshot {
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.account, &self.fetched_at)
    }

    pub fn payload(&self) -> SyncPayload<'_> {
        SyncPayload {
            account: &self.account,
            fetched_at: &self.fetched_at,
            native_balance: &self.native_balance,
            token_balances: &self.token_balances,
            partial: self.partial,
        }
    }
}

/// Body of `POST portfolio`. `(account, fetchedAt)` is the backend's dedup key.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload<'a> {
    pub account: &'a AccountAddress,
    pub fetched_at: &'a DateTime<Utc>,
    pub native_balance: &'a BalanceEntry,
    pub token_balances: &'a BTreeMap<String, BalanceEntry>,
    pub partial: bool,
}
