use crate::domain::commission::Commission;
use crate::domain::ledger::LedgerEntry;
use crate::domain::payee::PayeeProfile;
use crate::domain::ports::{
    AppendOutcome, CommissionStore, LedgerStore, PayeeDirectory, WatermarkStore,
};
use crate::error::{Result, SettlementError};
use crate::infrastructure::in_memory::guarded_append;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for commission records, keyed by id.
pub const CF_COMMISSIONS: &str = "commissions";
/// Column Family for per-payee ledger queues, keyed by payee id.
pub const CF_LEDGER: &str = "ledger";
/// Column Family for payee profiles.
pub const CF_PAYEES: &str = "payees";
/// Column Family for job watermarks, keyed by name.
pub const CF_WATERMARKS: &str = "watermarks";

/// A persistent store implementation using RocksDB.
///
/// One instance backs every store port, each in its own Column Family with
/// JSON values. Read-modify-write operations (compare-and-swap, ledger
/// append/remove) serialize on a single write lock.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_COMMISSIONS, CF_LEDGER, CF_PAYEES, CF_WATERMARKS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SettlementError::StorageError(format!("column family {name} not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(self.cf(cf)?, key, bytes)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Box<[u8]>, T)>> {
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (key, value) = item?;
            rows.push((key, serde_json::from_slice(&value)?));
        }
        Ok(rows)
    }

    fn commissions_where(&self, pred: impl Fn(&Commission) -> bool) -> Result<Vec<Commission>> {
        let mut found: Vec<Commission> = self
            .scan::<Commission>(CF_COMMISSIONS)?
            .into_iter()
            .map(|(_, c)| c)
            .filter(|c| pred(c))
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }
}

#[async_trait]
impl CommissionStore for RocksDBStore {
    async fn insert(&self, mut commission: Commission) -> Result<Commission> {
        let _guard = self.write_lock.lock().await;
        let key = commission.id.as_bytes();
        if self.read::<Commission>(CF_COMMISSIONS, key)?.is_some() {
            return Err(SettlementError::ValidationError(format!(
                "commission {} already exists",
                commission.id
            )));
        }
        commission.version = 1;
        self.write(CF_COMMISSIONS, key, &commission)?;
        Ok(commission)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Commission>> {
        self.read(CF_COMMISSIONS, id.as_bytes())
    }

    async fn compare_and_swap(&self, mut commission: Commission) -> Result<Option<Commission>> {
        let _guard = self.write_lock.lock().await;
        let key = commission.id.as_bytes();
        let Some(stored) = self.read::<Commission>(CF_COMMISSIONS, key)? else {
            return Err(SettlementError::NotFound(format!("commission {}", commission.id)));
        };
        if stored.version != commission.version {
            return Ok(None);
        }
        commission.version += 1;
        self.write(CF_COMMISSIONS, key, &commission)?;
        Ok(Some(commission))
    }

    async fn delete(&self, commission: &Commission) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = commission.id.as_bytes();
        match self.read::<Commission>(CF_COMMISSIONS, key)? {
            Some(stored) if stored.version == commission.version => {
                self.db.delete_cf(self.cf(CF_COMMISSIONS)?, key)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_requester(&self, requester_id: Uuid) -> Result<Vec<Commission>> {
        self.commissions_where(|c| c.requester_id == requester_id)
    }

    async fn list_by_fulfiller(&self, fulfiller_id: Uuid) -> Result<Vec<Commission>> {
        self.commissions_where(|c| c.fulfiller_id == fulfiller_id)
    }

    async fn find_by_checkout_session(&self, session_id: &str) -> Result<Option<Commission>> {
        Ok(self
            .commissions_where(|c| c.checkout_session_id.as_deref() == Some(session_id))?
            .into_iter()
            .next())
    }

    async fn find_by_payment(&self, payment_confirmation_id: &str) -> Result<Option<Commission>> {
        Ok(self
            .commissions_where(|c| {
                c.payment_confirmation_id.as_deref() == Some(payment_confirmation_id)
            })?
            .into_iter()
            .next())
    }

    async fn list_in_flight(&self) -> Result<Vec<Commission>> {
        self.commissions_where(|c| c.status.is_in_flight())
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn append(&self, payee_id: Uuid, entry: LedgerEntry) -> Result<AppendOutcome> {
        let _guard = self.write_lock.lock().await;
        let key = payee_id.as_bytes();
        let mut queue: Vec<LedgerEntry> = self.read(CF_LEDGER, key)?.unwrap_or_default();
        let outcome = guarded_append(&mut queue, entry);
        if outcome == AppendOutcome::Appended {
            self.write(CF_LEDGER, key, &queue)?;
        }
        Ok(outcome)
    }

    async fn entries(&self, payee_id: Uuid) -> Result<Vec<LedgerEntry>> {
        Ok(self.read(CF_LEDGER, payee_id.as_bytes())?.unwrap_or_default())
    }

    async fn remove(&self, payee_id: Uuid, entry_ids: &[Uuid]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let key = payee_id.as_bytes();
        let Some(mut queue) = self.read::<Vec<LedgerEntry>>(CF_LEDGER, key)? else {
            return Ok(0);
        };
        let before = queue.len();
        queue.retain(|e| !entry_ids.contains(&e.id));
        let removed = before - queue.len();
        if queue.is_empty() {
            self.db.delete_cf(self.cf(CF_LEDGER)?, key)?;
        } else if removed > 0 {
            self.write(CF_LEDGER, key, &queue)?;
        }
        Ok(removed)
    }

    async fn payees_with_entries(&self) -> Result<Vec<Uuid>> {
        let mut payees = Vec::new();
        for (key, queue) in self.scan::<Vec<LedgerEntry>>(CF_LEDGER)? {
            if queue.is_empty() {
                continue;
            }
            let id = Uuid::from_slice(&key)
                .map_err(|e| SettlementError::StorageError(format!("bad ledger key: {e}")))?;
            payees.push(id);
        }
        payees.sort();
        Ok(payees)
    }

    async fn import(&self, payee_id: Uuid, entries: Vec<LedgerEntry>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = payee_id.as_bytes();
        let mut queue: Vec<LedgerEntry> = self.read(CF_LEDGER, key)?.unwrap_or_default();
        queue.extend(entries);
        self.write(CF_LEDGER, key, &queue)
    }
}

#[async_trait]
impl PayeeDirectory for RocksDBStore {
    async fn get(&self, payee_id: Uuid) -> Result<Option<PayeeProfile>> {
        self.read(CF_PAYEES, payee_id.as_bytes())
    }

    async fn upsert(&self, profile: PayeeProfile) -> Result<()> {
        self.write(CF_PAYEES, profile.id.as_bytes(), &profile)
    }
}

#[async_trait]
impl WatermarkStore for RocksDBStore {
    async fn get(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.read(CF_WATERMARKS, name.as_bytes())
    }

    async fn set(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.write(CF_WATERMARKS, name.as_bytes(), &at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::commission::{CommissionStatus, SubscriptionTier};
    use crate::domain::ledger::EntrySource;
    use crate::domain::money::Money;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn commission() -> Commission {
        Commission::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Money::new(dec!(25)),
            SubscriptionTier::Studio,
            2,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        for name in [CF_COMMISSIONS, CF_LEDGER, CF_PAYEES, CF_WATERMARKS] {
            assert!(store.db.cf_handle(name).is_some());
        }
    }

    #[tokio::test]
    async fn test_rocksdb_commission_cas() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let stored = store.insert(commission()).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut first = stored.clone();
        first.status = CommissionStatus::Requested;
        let saved = store.compare_and_swap(first).await.unwrap().unwrap();
        assert_eq!(saved.version, 2);

        let mut stale = stored.clone();
        stale.status = CommissionStatus::RejectedByArtist;
        assert!(store.compare_and_swap(stale).await.unwrap().is_none());

        let current = CommissionStore::get(&store, stored.id).await.unwrap().unwrap();
        assert_eq!(current.status, CommissionStatus::Requested);
        assert_eq!(store.list_in_flight().await.unwrap().len(), 1);
        assert_eq!(
            store.list_by_fulfiller(stored.fulfiller_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let payee = Uuid::new_v4();
        let entry = LedgerEntry::new(
            Money::new(dec!(12.5)),
            EntrySource::CheckoutPurchase,
            "print",
            Utc::now(),
        )
        .with_payment("pi_1");

        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            assert_eq!(
                store.append(payee, entry.clone()).await.unwrap(),
                AppendOutcome::Appended
            );
            let mut replay = entry.clone();
            replay.id = Uuid::new_v4();
            assert_eq!(
                store.append(payee, replay).await.unwrap(),
                AppendOutcome::Duplicate
            );
            store.set("last_cleanup_at", entry.created_at).await.unwrap();
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        assert_eq!(store.payees_with_entries().await.unwrap(), vec![payee]);
        assert_eq!(store.entries(payee).await.unwrap(), vec![entry.clone()]);
        assert_eq!(
            WatermarkStore::get(&store, "last_cleanup_at").await.unwrap(),
            Some(entry.created_at)
        );

        assert_eq!(store.remove(payee, &[entry.id]).await.unwrap(), 1);
        assert!(store.payees_with_entries().await.unwrap().is_empty());
    }
}
