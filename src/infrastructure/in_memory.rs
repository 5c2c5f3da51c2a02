use crate::domain::commission::Commission;
use crate::domain::ledger::{EntrySource, LedgerEntry};
use crate::domain::payee::PayeeProfile;
use crate::domain::ports::{
    AppendOutcome, CommissionStore, LedgerStore, PayeeDirectory, WatermarkStore,
};
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Applies the dedup rules to a payee queue and appends when they pass.
///
/// Shared by every store backend so the idempotency boundary is identical.
pub(crate) fn guarded_append(queue: &mut Vec<LedgerEntry>, entry: LedgerEntry) -> AppendOutcome {
    if entry.source == EntrySource::CommissionPayout
        && let Some(commission_id) = entry.commission_id
        && queue.iter().any(|e| {
            e.source == EntrySource::CommissionPayout && e.commission_id == Some(commission_id)
        })
    {
        return AppendOutcome::AlreadyQueued;
    }
    if let Some(key) = entry.dedup_key()
        && queue.iter().any(|e| e.dedup_key().as_ref() == Some(&key))
    {
        return AppendOutcome::Duplicate;
    }
    queue.push(entry);
    AppendOutcome::Appended
}

/// A thread-safe in-memory commission store.
///
/// Secondary lookups scan the map; fine for tests and single-node runs.
#[derive(Default, Clone)]
pub struct InMemoryCommissionStore {
    commissions: Arc<RwLock<HashMap<Uuid, Commission>>>,
}

impl InMemoryCommissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommissionStore for InMemoryCommissionStore {
    async fn insert(&self, mut commission: Commission) -> Result<Commission> {
        let mut commissions = self.commissions.write().await;
        if commissions.contains_key(&commission.id) {
            return Err(SettlementError::ValidationError(format!(
                "commission {} already exists",
                commission.id
            )));
        }
        commission.version = 1;
        commissions.insert(commission.id, commission.clone());
        Ok(commission)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Commission>> {
        let commissions = self.commissions.read().await;
        Ok(commissions.get(&id).cloned())
    }

    async fn compare_and_swap(&self, mut commission: Commission) -> Result<Option<Commission>> {
        let mut commissions = self.commissions.write().await;
        let Some(current) = commissions.get(&commission.id) else {
            return Err(SettlementError::NotFound(format!(
                "commission {}",
                commission.id
            )));
        };
        if current.version != commission.version {
            return Ok(None);
        }
        commission.version += 1;
        commissions.insert(commission.id, commission.clone());
        Ok(Some(commission))
    }

    async fn delete(&self, commission: &Commission) -> Result<bool> {
        let mut commissions = self.commissions.write().await;
        match commissions.get(&commission.id) {
            Some(current) if current.version == commission.version => {
                commissions.remove(&commission.id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_requester(&self, requester_id: Uuid) -> Result<Vec<Commission>> {
        let commissions = self.commissions.read().await;
        let mut found: Vec<_> = commissions
            .values()
            .filter(|c| c.requester_id == requester_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn list_by_fulfiller(&self, fulfiller_id: Uuid) -> Result<Vec<Commission>> {
        let commissions = self.commissions.read().await;
        let mut found: Vec<_> = commissions
            .values()
            .filter(|c| c.fulfiller_id == fulfiller_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn find_by_checkout_session(&self, session_id: &str) -> Result<Option<Commission>> {
        let commissions = self.commissions.read().await;
        Ok(commissions
            .values()
            .find(|c| c.checkout_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn find_by_payment(&self, payment_confirmation_id: &str) -> Result<Option<Commission>> {
        let commissions = self.commissions.read().await;
        Ok(commissions
            .values()
            .find(|c| c.payment_confirmation_id.as_deref() == Some(payment_confirmation_id))
            .cloned())
    }

    async fn list_in_flight(&self) -> Result<Vec<Commission>> {
        let commissions = self.commissions.read().await;
        let mut found: Vec<_> = commissions
            .values()
            .filter(|c| c.status.is_in_flight())
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }
}

/// In-memory payee queues.
///
/// `Vec` per payee keeps insertion order; the single write lock makes each
/// append or removal atomic for that payee.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    queues: Arc<RwLock<HashMap<Uuid, Vec<LedgerEntry>>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append(&self, payee_id: Uuid, entry: LedgerEntry) -> Result<AppendOutcome> {
        let mut queues = self.queues.write().await;
        Ok(guarded_append(queues.entry(payee_id).or_default(), entry))
    }

    async fn entries(&self, payee_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let queues = self.queues.read().await;
        Ok(queues.get(&payee_id).cloned().unwrap_or_default())
    }

    async fn remove(&self, payee_id: Uuid, entry_ids: &[Uuid]) -> Result<usize> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(&payee_id) else {
            return Ok(0);
        };
        let before = queue.len();
        queue.retain(|e| !entry_ids.contains(&e.id));
        let removed = before - queue.len();
        if queue.is_empty() {
            queues.remove(&payee_id);
        }
        Ok(removed)
    }

    async fn payees_with_entries(&self) -> Result<Vec<Uuid>> {
        let queues = self.queues.read().await;
        let mut payees: Vec<_> = queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(id, _)| *id)
            .collect();
        payees.sort();
        Ok(payees)
    }

    async fn import(&self, payee_id: Uuid, entries: Vec<LedgerEntry>) -> Result<()> {
        let mut queues = self.queues.write().await;
        queues.entry(payee_id).or_default().extend(entries);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryPayeeDirectory {
    profiles: Arc<RwLock<HashMap<Uuid, PayeeProfile>>>,
}

impl InMemoryPayeeDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayeeDirectory for InMemoryPayeeDirectory {
    async fn get(&self, payee_id: Uuid) -> Result<Option<PayeeProfile>> {
        let profiles = self.profiles.read().await;
        Ok(profiles.get(&payee_id).cloned())
    }

    async fn upsert(&self, profile: PayeeProfile) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        profiles.insert(profile.id, profile);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryWatermarkStore {
    marks: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn get(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let marks = self.marks.read().await;
        Ok(marks.get(name).copied())
    }

    async fn set(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut marks = self.marks.write().await;
        marks.insert(name.to_string(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::commission::{CommissionStatus, SubscriptionTier};
    use crate::domain::money::Money;
    use rust_decimal_macros::dec;

    fn commission() -> Commission {
        Commission::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Money::new(dec!(20)),
            SubscriptionTier::Pro,
            1,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_version() {
        let store = InMemoryCommissionStore::new();
        let stored = store.insert(commission()).await.unwrap();

        let mut first = stored.clone();
        first.status = CommissionStatus::Requested;
        let mut second = stored.clone();
        second.status = CommissionStatus::RejectedByArtist;

        let written = store.compare_and_swap(first).await.unwrap().unwrap();
        assert_eq!(written.version, stored.version + 1);
        assert!(store.compare_and_swap(second).await.unwrap().is_none());

        let current = store.get(stored.id).await.unwrap().unwrap();
        assert_eq!(current.status, CommissionStatus::Requested);
    }

    #[tokio::test]
    async fn test_secondary_lookups() {
        let store = InMemoryCommissionStore::new();
        let mut c = commission();
        c.checkout_session_id = Some("cs_1".to_string());
        c.payment_confirmation_id = Some("pi_1".to_string());
        let stored = store.insert(c).await.unwrap();

        assert_eq!(store.list_by_requester(stored.requester_id).await.unwrap().len(), 1);
        assert_eq!(store.list_by_fulfiller(stored.fulfiller_id).await.unwrap().len(), 1);
        assert!(store.list_by_requester(stored.fulfiller_id).await.unwrap().is_empty());
        assert_eq!(
            store.find_by_checkout_session("cs_1").await.unwrap().unwrap().id,
            stored.id
        );
        assert_eq!(store.find_by_payment("pi_1").await.unwrap().unwrap().id, stored.id);
        assert!(store.find_by_payment("pi_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ledger_append_preserves_order_and_dedups() {
        let store = InMemoryLedgerStore::new();
        let payee = Uuid::new_v4();
        let now = Utc::now();

        let first = LedgerEntry::new(Money::new(dec!(5)), EntrySource::CheckoutPurchase, "first", now)
            .with_payment("pi_1");
        let replay = LedgerEntry::new(Money::new(dec!(5)), EntrySource::CheckoutPurchase, "replay", now)
            .with_payment("pi_1");
        let second = LedgerEntry::new(Money::new(dec!(7)), EntrySource::ManualAdjustment, "second", now);

        assert_eq!(store.append(payee, first.clone()).await.unwrap(), AppendOutcome::Appended);
        assert_eq!(store.append(payee, replay).await.unwrap(), AppendOutcome::Duplicate);
        assert_eq!(store.append(payee, second.clone()).await.unwrap(), AppendOutcome::Appended);

        let entries = store.entries(payee).await.unwrap();
        assert_eq!(entries, vec![first.clone(), second]);

        assert_eq!(store.remove(payee, &[first.id]).await.unwrap(), 1);
        assert_eq!(store.entries(payee).await.unwrap().len(), 1);
        assert_eq!(store.payees_with_entries().await.unwrap(), vec![payee]);
    }

    #[tokio::test]
    async fn test_ledger_rejects_second_payout_for_commission() {
        let store = InMemoryLedgerStore::new();
        let payee = Uuid::new_v4();
        let commission_id = Uuid::new_v4();
        let now = Utc::now();
        let payout = || {
            LedgerEntry::new(Money::new(dec!(10)), EntrySource::CommissionPayout, "payout", now)
                .for_commission(commission_id)
        };

        assert_eq!(store.append(payee, payout()).await.unwrap(), AppendOutcome::Appended);
        assert_eq!(store.append(payee, payout()).await.unwrap(), AppendOutcome::AlreadyQueued);
    }

    #[tokio::test]
    async fn test_watermarks() {
        let store = InMemoryWatermarkStore::new();
        assert!(store.get("cleanup").await.unwrap().is_none());
        let now = Utc::now();
        store.set("cleanup", now).await.unwrap();
        assert_eq!(store.get("cleanup").await.unwrap(), Some(now));
    }
}
