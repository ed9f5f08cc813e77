//! Ledger records and identifiers shared across the scanner and storage crates.

use std::fmt;

use chrono::{DateTime, Utc};
use strum_macros::{AsRefStr, Display, EnumString, IntoStaticStr};

/// Ledger position of a payment event. Ordering is lexicographic on
/// `(block, log_index)`, which is the authoritative processing order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark {
    pub block: u64,
    pub log_index: u64,
}

impl Watermark {
    /// Cursor value meaning "nothing processed yet".
    pub const ORIGIN: Watermark = Watermark {
        block: 0,
        log_index: 0,
    };

    pub fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }

    pub fn is_origin(&self) -> bool {
        *self == Self::ORIGIN
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.log_index)
    }
}

/// Immutable payment fact read from the ledger.
///
/// `amount` keeps the exact text stored by the ledger (smallest unit, e.g.
/// wei); use [`PaymentRecord::amount_units`] for the numeric value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub id: String,
    pub amount: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,
    pub address: String,
}

impl PaymentRecord {
    pub fn position(&self) -> Watermark {
        Watermark::new(self.block_number, self.log_index)
    }

    /// Parses the stored amount. Malformed text yields `None` rather than an
    /// error; downstream stages treat such rows as having no usable amount.
    pub fn amount_units(&self) -> Option<u128> {
        self.amount.trim().parse().ok()
    }
}

/// Payment to append to the ledger (seeding and tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub id: String,
    pub address: String,
    pub amount: String,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,
}

/// Detection rules; the serialized form is the tag the alert consumer expects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, IntoStaticStr,
)]
pub enum DetectionRule {
    /// Quartile/IQR range detector.
    #[strum(serialize = "IQR")]
    Range,
    /// Z-score deviation detector.
    #[strum(serialize = "ZSCORE")]
    Deviation,
    /// Isolation-forest detector.
    #[strum(serialize = "ISOLATION_FOREST")]
    Isolation,
}

impl DetectionRule {
    pub fn tag(self) -> &'static str {
        self.into()
    }
}

/// Stable identifier of a (transaction, rule) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// Derives `{prefix}an:{tx_hash}:{RULE}`. The same pair always maps to the
    /// same key no matter how often detection recomputes it.
    pub fn derive(prefix: &str, tx_hash: &str, rule: DetectionRule) -> Self {
        Self(format!("{prefix}an:{tx_hash}:{}", rule.tag()))
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
