//! Ledger Core Types
//!
//! Entries, postings, accounts and balances as the double-entry engine sees them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, EntryId, SeqNum};
use crate::error::LedgerError;

/// Account sub-balance kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountKind {
    /// Freely usable funds
    Available,
    /// Funds reserved against an open order
    Hold,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Available => "AVAILABLE",
            AccountKind::Hold => "HOLD",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE" => Ok(AccountKind::Available),
            "HOLD" => Ok(AccountKind::Hold),
            other => Err(LedgerError::InvalidAccountId(format!(
                "unknown account kind '{}'",
                other
            ))),
        }
    }
}

/// Who owns an account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccountOwner {
    User(String),
    System(String),
}

impl AccountOwner {
    pub fn is_system(&self) -> bool {
        matches!(self, AccountOwner::System(_))
    }

    /// Owner id as stored in the `accounts.owner_id` column
    pub fn id(&self) -> &str {
        match self {
            AccountOwner::User(id) | AccountOwner::System(id) => id,
        }
    }
}

/// Composite account identifier: owner, currency and kind.
///
/// Textual form is `user:{id}:{CCY}:{KIND}` or `system:{name}:{CCY}:{KIND}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountId {
    owner: AccountOwner,
    currency: String,
    kind: AccountKind,
}

impl AccountId {
    pub fn user(user_id: &str, currency: &str, kind: AccountKind) -> Self {
        Self {
            owner: AccountOwner::User(user_id.trim().to_string()),
            currency: currency.trim().to_ascii_uppercase(),
            kind,
        }
    }

    /// Like [`AccountId::user`] but rejects blank ids and ids containing ':'
    pub fn try_user(user_id: &str, currency: &str, kind: AccountKind) -> Result<Self, LedgerError> {
        let account = Self::user(user_id, currency, kind);
        account.validate()?;
        Ok(account)
    }

    /// System accounts are always AVAILABLE
    pub fn system(name: &str, currency: &str) -> Self {
        Self {
            owner: AccountOwner::System(name.trim().to_string()),
            currency: currency.trim().to_ascii_uppercase(),
            kind: AccountKind::Available,
        }
    }

    pub fn owner(&self) -> &AccountOwner {
        &self.owner
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    pub fn is_system(&self) -> bool {
        self.owner.is_system()
    }

    fn validate(&self) -> Result<(), LedgerError> {
        let id = self.owner.id();
        if id.is_empty() || id.contains(':') {
            return Err(LedgerError::InvalidAccountId(format!("invalid owner '{}'", id)));
        }
        if self.currency.is_empty() || self.currency.contains(':') {
            return Err(LedgerError::InvalidAccountId(format!(
                "invalid currency '{}'",
                self.currency
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.owner {
            AccountOwner::User(_) => "user",
            AccountOwner::System(_) => "system",
        };
        write!(
            f,
            "{}:{}:{}:{}",
            prefix,
            self.owner.id(),
            self.currency,
            self.kind
        )
    }
}

impl FromStr for AccountId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(LedgerError::InvalidAccountId(s.to_string()));
        }
        let kind: AccountKind = parts[3].parse()?;
        let account = match parts[0] {
            "user" => AccountId::user(parts[1], parts[2], kind),
            "system" => AccountId {
                owner: AccountOwner::System(parts[1].to_string()),
                currency: parts[2].to_ascii_uppercase(),
                kind,
            },
            _ => return Err(LedgerError::InvalidAccountId(s.to_string())),
        };
        account.validate()?;
        Ok(account)
    }
}

/// What business object an entry references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    Trade,
    Order,
    Adjustment,
    Correction,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Trade => "TRADE",
            ReferenceType::Order => "ORDER",
            ReferenceType::Adjustment => "ADJUSTMENT",
            ReferenceType::Correction => "CORRECTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRADE" => Some(ReferenceType::Trade),
            "ORDER" => Some(ReferenceType::Order),
            "ADJUSTMENT" => Some(ReferenceType::Adjustment),
            "CORRECTION" => Some(ReferenceType::Correction),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Fill,
    Reserve,
    Release,
    ManualAdjustment,
    Reversal,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Fill => "FILL",
            EntryKind::Reserve => "RESERVE",
            EntryKind::Release => "RELEASE",
            EntryKind::ManualAdjustment => "MANUAL_ADJUSTMENT",
            EntryKind::Reversal => "REVERSAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FILL" => Some(EntryKind::Fill),
            "RESERVE" => Some(EntryKind::Reserve),
            "RELEASE" => Some(EntryKind::Release),
            "MANUAL_ADJUSTMENT" => Some(EntryKind::ManualAdjustment),
            "REVERSAL" => Some(EntryKind::Reversal),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One leg of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub account_id: AccountId,
    pub currency: String,
    pub amount: Amount,
    pub is_debit: bool,
}

impl Posting {
    pub fn debit(account_id: AccountId, amount: Amount) -> Self {
        let currency = account_id.currency().to_string();
        Self {
            account_id,
            currency,
            amount,
            is_debit: true,
        }
    }

    pub fn credit(account_id: AccountId, amount: Amount) -> Self {
        let currency = account_id.currency().to_string();
        Self {
            account_id,
            currency,
            amount,
            is_debit: false,
        }
    }

    /// Debits add to the account balance, credits subtract
    #[inline]
    pub fn signed_delta(&self) -> Amount {
        if self.is_debit {
            self.amount
        } else {
            -self.amount
        }
    }

    /// Same leg with debit/credit flipped
    pub fn reversed(&self) -> Self {
        Self {
            is_debit: !self.is_debit,
            ..self.clone()
        }
    }
}

/// One logical transaction. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub reference_type: ReferenceType,
    pub reference_id: String,
    pub entry_kind: EntryKind,
    pub symbol: String,
    pub engine_seq: SeqNum,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
    pub causation_id: String,
    pub postings: Vec<Posting>,
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Entry[{}] {} {} ref={} symbol={} seq={} postings={}",
            self.entry_id,
            self.reference_type,
            self.entry_kind,
            self.reference_id,
            self.symbol,
            self.engine_seq,
            self.postings.len()
        )
    }
}

/// Materialized running total for one account/currency pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub currency: String,
    pub balance: Amount,
}

impl AccountBalance {
    /// Map key used by balance listings: `{account_id}:{currency}`
    pub fn key(&self) -> String {
        format!("{}:{}", self.account_id, self.currency)
    }
}

/// Result of a durable append attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// First insert of this entry id
    Applied,
    /// Entry id already stored. Nothing was written.
    Duplicate,
}

impl AppendOutcome {
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, AppendOutcome::Applied)
    }
}

/// Machine-readable outcome of a settlement-style operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementReason {
    Applied,
    Duplicate,
    Dlq,
    AlreadyApplied,
    NotApproved,
}

impl SettlementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementReason::Applied => "applied",
            SettlementReason::Duplicate => "duplicate",
            SettlementReason::Dlq => "dlq",
            SettlementReason::AlreadyApplied => "already_applied",
            SettlementReason::NotApproved => "not_approved",
        }
    }
}

impl fmt::Display for SettlementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub applied: bool,
    pub entry_id: EntryId,
    pub reason: SettlementReason,
}

impl SettlementResult {
    pub fn new(entry_id: impl Into<String>, reason: SettlementReason) -> Self {
        Self {
            applied: reason == SettlementReason::Applied,
            entry_id: entry_id.into(),
            reason,
        }
    }

    pub fn from_outcome(entry_id: impl Into<String>, outcome: AppendOutcome) -> Self {
        match outcome {
            AppendOutcome::Applied => Self::new(entry_id, SettlementReason::Applied),
            AppendOutcome::Duplicate => Self::new(entry_id, SettlementReason::Duplicate),
        }
    }
}

/// Event that failed to settle, kept for offline replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub event_id: String,
    pub reason: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Lookup of the entry a trade settled into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeLookup {
    pub trade_id: String,
    pub entry_id: EntryId,
    pub symbol: String,
    pub engine_seq: SeqNum,
    pub occurred_at: DateTime<Utc>,
}

/// Base/quote split of a `BASE-QUOTE` symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolParts {
    pub base: String,
    pub quote: String,
}

impl SymbolParts {
    pub fn parse(symbol: &str) -> Result<Self, LedgerError> {
        let mut parts = symbol.split('-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None)
                if !base.trim().is_empty() && !quote.trim().is_empty() =>
            {
                Ok(Self {
                    base: base.trim().to_ascii_uppercase(),
                    quote: quote.trim().to_ascii_uppercase(),
                })
            }
            _ => Err(LedgerError::InvalidSymbol(symbol.to_string())),
        }
    }
}

/// Order side, selects which currency a hold is taken in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Buyers hold quote currency, sellers hold base currency
    pub fn hold_currency<'a>(&self, parts: &'a SymbolParts) -> &'a str {
        match self {
            Side::Buy => &parts.quote,
            Side::Sell => &parts.base,
        }
    }
}

impl FromStr for Side {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(LedgerError::InvalidSide(s.to_string())),
        }
    }
}
