use super::commission::Commission;
use super::events::{
    CheckoutCompleted, CheckoutSession, Metadata, Notification, PaymentStatus, ProcessorBalance,
    RefundReceipt, TransferReceipt,
};
use super::ledger::LedgerEntry;
use super::money::Amount;
use super::payee::PayeeProfile;
use crate::error::{ProcessorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Result of a guarded ledger append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended,
    /// Same payment id, amount and source already queued.
    Duplicate,
    /// A commission-payout entry for that commission is already queued.
    AlreadyQueued,
}

#[async_trait]
pub trait CommissionStore: Send + Sync {
    /// Inserts a new record. Fails if the id already exists.
    async fn insert(&self, commission: Commission) -> Result<Commission>;
    async fn get(&self, id: Uuid) -> Result<Option<Commission>>;
    /// Writes `commission` only if the stored version still equals
    /// `commission.version`. Returns the stored record with its bumped version,
    /// or `None` when another writer got there first.
    async fn compare_and_swap(&self, commission: Commission) -> Result<Option<Commission>>;
    /// Deletes the record if its stored version still matches.
    async fn delete(&self, commission: &Commission) -> Result<bool>;
    async fn list_by_requester(&self, requester_id: Uuid) -> Result<Vec<Commission>>;
    async fn list_by_fulfiller(&self, fulfiller_id: Uuid) -> Result<Vec<Commission>>;
    async fn find_by_checkout_session(&self, session_id: &str) -> Result<Option<Commission>>;
    async fn find_by_payment(&self, payment_confirmation_id: &str) -> Result<Option<Commission>>;
    async fn list_in_flight(&self) -> Result<Vec<Commission>>;
}

/// Per-payee, insertion-ordered queues of money owed.
///
/// Every method is atomic with respect to a single payee's queue.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, payee_id: Uuid, entry: LedgerEntry) -> Result<AppendOutcome>;
    async fn entries(&self, payee_id: Uuid) -> Result<Vec<LedgerEntry>>;
    /// Removes the listed entries, returning how many were present.
    async fn remove(&self, payee_id: Uuid, entry_ids: &[Uuid]) -> Result<usize>;
    async fn payees_with_entries(&self) -> Result<Vec<Uuid>>;
    /// Appends without dedup checks. Migration and restore only.
    async fn import(&self, payee_id: Uuid, entries: Vec<LedgerEntry>) -> Result<()>;
}

/// Read side of account management, plus the writer it owns.
#[async_trait]
pub trait PayeeDirectory: Send + Sync {
    async fn get(&self, payee_id: Uuid) -> Result<Option<PayeeProfile>>;
    async fn upsert(&self, profile: PayeeProfile) -> Result<()>;
}

/// Persisted last-run timestamps for periodic jobs.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<DateTime<Utc>>>;
    async fn set(&self, name: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_checkout(
        &self,
        amount: Amount,
        metadata: Metadata,
    ) -> std::result::Result<CheckoutSession, ProcessorError>;
    async fn retrieve_payment(
        &self,
        payment_confirmation_id: &str,
    ) -> std::result::Result<PaymentStatus, ProcessorError>;
    async fn create_refund(
        &self,
        payment_confirmation_id: &str,
        metadata: Metadata,
    ) -> std::result::Result<RefundReceipt, ProcessorError>;
    async fn retrieve_balance(&self) -> std::result::Result<ProcessorBalance, ProcessorError>;
    async fn create_transfer(
        &self,
        amount: Amount,
        destination: &str,
        metadata: Metadata,
    ) -> std::result::Result<TransferReceipt, ProcessorError>;
    async fn list_completed_checkouts(
        &self,
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<CheckoutCompleted>, ProcessorError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type CommissionStoreRef = Arc<dyn CommissionStore>;
pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type PayeeDirectoryRef = Arc<dyn PayeeDirectory>;
pub type WatermarkStoreRef = Arc<dyn WatermarkStore>;
pub type PaymentProcessorRef = Arc<dyn PaymentProcessor>;
pub type NotifierRef = Arc<dyn Notifier>;
pub type ClockRef = Arc<dyn Clock>;
