use super::money::{AMOUNT_CEILING, Money};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata key holding the processor payment id an entry was derived from.
pub const PAYMENT_CONFIRMATION_KEY: &str = "payment_confirmation_id";

/// Why a payee is owed money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntrySource {
    CheckoutPurchase,
    CommissionPayout,
    ManualAdjustment,
    /// Anything persisted under a source this build does not know.
    #[serde(other)]
    Unrecognized,
}

/// One amount owed to a payee, waiting in that payee's queue.
///
/// The amount is kept as a raw `Money` rather than `Amount` so that corrupt
/// rows still load and can be swept out by the cleanup pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub amount: Money,
    pub source: EntrySource,
    pub reference: String,
    pub commission_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Identity used to recognise the same money twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub payment_confirmation_id: String,
    pub amount: Decimal,
    pub source: EntrySource,
}

impl LedgerEntry {
    pub fn new(
        amount: Money,
        source: EntrySource,
        reference: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            amount,
            source,
            reference: reference.into(),
            commission_id: None,
            metadata: BTreeMap::new(),
            created_at,
        }
    }

    pub fn for_commission(mut self, commission_id: Uuid) -> Self {
        self.commission_id = Some(commission_id);
        self.metadata
            .insert("commission_id".to_string(), commission_id.to_string());
        self
    }

    pub fn with_payment(mut self, payment_confirmation_id: impl Into<String>) -> Self {
        self.metadata
            .insert(PAYMENT_CONFIRMATION_KEY.to_string(), payment_confirmation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn payment_confirmation_id(&self) -> Option<&str> {
        self.metadata.get(PAYMENT_CONFIRMATION_KEY).map(String::as_str)
    }

    /// Entries without a payment id have no dedup identity.
    pub fn dedup_key(&self) -> Option<DedupKey> {
        self.payment_confirmation_id().map(|id| DedupKey {
            payment_confirmation_id: id.to_string(),
            amount: self.amount.value().normalize(),
            source: self.source,
        })
    }

    /// Positive, under the ceiling, and of a known source.
    pub fn is_structurally_valid(&self) -> bool {
        self.amount.is_positive()
            && self.amount.value() <= AMOUNT_CEILING
            && self.source != EntrySource::Unrecognized
    }
}
