//! Application layer: the settlement core.
//!
//! The lifecycle controller takes actor-driven transitions. The reconciler,
//! dispatcher and sweeper are background services over the same stores; they
//! coordinate only through optimistic writes on commission records and atomic
//! per-payee ledger operations, so any of them may run concurrently with live
//! controller calls.

pub mod controller;
pub mod dispatcher;
pub mod reconciler;
pub mod scheduler;
pub mod sweeper;

use crate::domain::commission::Commission;
use crate::domain::events::Notification;
use crate::domain::ports::{
    ClockRef, CommissionStore, CommissionStoreRef, LedgerStoreRef, Notifier, NotifierRef,
    PayeeDirectoryRef, PaymentProcessorRef, WatermarkStoreRef,
};
use crate::error::{Result, SettlementError};
use uuid::Uuid;

/// How many times a commission write is retried after losing a version race.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Everything the settlement services talk to.
#[derive(Clone)]
pub struct SettlementContext {
    pub commissions: CommissionStoreRef,
    pub ledger: LedgerStoreRef,
    pub payees: PayeeDirectoryRef,
    pub watermarks: WatermarkStoreRef,
    pub processor: PaymentProcessorRef,
    pub notifier: NotifierRef,
    pub clock: ClockRef,
}

/// Read-modify-write of one commission under optimistic concurrency.
///
/// `mutate` runs against a fresh read on every attempt, so preconditions it
/// checks (usually via `Commission::advance`) are re-validated after a lost
/// race. An error from `mutate` aborts without writing.
pub(crate) async fn update_commission<F>(
    store: &dyn CommissionStore,
    id: Uuid,
    mut mutate: F,
) -> Result<Commission>
where
    F: FnMut(&mut Commission) -> Result<()> + Send,
{
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let mut commission = store
            .get(id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("commission {id}")))?;
        mutate(&mut commission)?;
        if let Some(saved) = store.compare_and_swap(commission).await? {
            return Ok(saved);
        }
        tracing::debug!(commission_id = %id, attempt, "commission write lost a version race, retrying");
    }
    Err(SettlementError::StorageError(format!(
        "commission {id} kept changing underneath {MAX_WRITE_ATTEMPTS} write attempts"
    )))
}

/// Sends a notification; delivery failures are logged and swallowed.
pub(crate) async fn notify(notifier: &dyn Notifier, notification: Notification) {
    let recipient = notification.recipient;
    let commission_id = notification.commission_id;
    if let Err(e) = notifier.notify(notification).await {
        tracing::warn!(%recipient, %commission_id, error = %e, "notification delivery failed");
    }
}
