use super::{SettlementContext, notify, update_commission};
use crate::domain::commission::{Commission, CommissionStatus};
use crate::domain::events::{Metadata, Notification, NotificationKind};
use crate::domain::ledger::{DedupKey, EntrySource, LedgerEntry};
use crate::domain::money::{Amount, Money};
use crate::error::{Result, SettlementError};
use chrono::Duration;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

pub const CLEANUP_WATERMARK: &str = "last_cleanup_at";

#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// Entries older than this are flagged for manual review. Never deleted.
    pub retention: Duration,
    /// Minimum spacing between cleanup passes, checked against the watermark.
    pub interval: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::days(30),
            interval: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Transferred { transfer_id: String },
    /// Processor refused or timed out. Entry kept for the next run.
    Failed { error: String },
    /// Not enough tracked liquidity left in this run. Entry kept.
    Deferred { needed: Money, remaining: Money },
    /// Linked commission was cancelled or already paid. Entry kept, not paid.
    HeldForReview { reason: String },
    /// Amount or source fails validation. Left for the cleanup pass.
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchItem {
    pub payee_id: Uuid,
    pub entry_id: Uuid,
    pub amount: Money,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    /// Available balance read at the start of the run.
    pub snapshot: Money,
    /// Set when the run did nothing at all.
    pub aborted: Option<String>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub held: usize,
    pub skipped_payees: usize,
    pub disbursed: Money,
    pub items: Vec<DispatchItem>,
}

impl DispatchReport {
    fn record(&mut self, item: DispatchItem) {
        self.processed += 1;
        match &item.outcome {
            DispatchOutcome::Transferred { .. } => {
                self.succeeded += 1;
                self.disbursed += item.amount;
            }
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Deferred { .. } => self.deferred += 1,
            DispatchOutcome::HeldForReview { .. } => self.held += 1,
            DispatchOutcome::Invalid => {}
        }
        self.items.push(item);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    RemovedInvalid,
    RemovedDuplicate,
    FlaggedStale,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupItem {
    pub payee_id: Uuid,
    pub entry_id: Uuid,
    pub amount: Money,
    pub action: CleanupAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub invalid_removed: usize,
    pub duplicates_removed: usize,
    pub stale_flagged: usize,
    pub items: Vec<CleanupItem>,
}

/// Drains payee ledger queues into processor transfers.
pub struct PayoutDispatcher {
    ctx: SettlementContext,
    policy: CleanupPolicy,
}

impl PayoutDispatcher {
    pub fn new(ctx: SettlementContext, policy: CleanupPolicy) -> Self {
        Self { ctx, policy }
    }

    /// One disbursement run.
    ///
    /// Liquidity is read once. Each payee's entries are tried earliest first
    /// against what is left of that snapshot; an entry is removed only after
    /// the processor returns a transfer id for it.
    pub async fn run(&self) -> DispatchReport {
        let balance = match self.ctx.processor.retrieve_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::error!(error = %e, "could not read processor balance, dispatch aborted");
                return DispatchReport {
                    aborted: Some(format!("balance unavailable: {e}")),
                    ..Default::default()
                };
            }
        };

        let mut report = DispatchReport {
            snapshot: balance.available,
            ..Default::default()
        };
        if !balance.available.is_positive() {
            tracing::info!(available = %balance.available, pending = %balance.pending, "no available balance, dispatch skipped");
            report.aborted = Some("no available balance".to_string());
            return report;
        }

        let payees = match self.ctx.ledger.payees_with_entries().await {
            Ok(payees) => payees,
            Err(e) => {
                tracing::error!(error = %e, "could not list ledger payees, dispatch aborted");
                report.aborted = Some(e.to_string());
                return report;
            }
        };

        let mut remaining = balance.available;
        for payee_id in payees {
            let Some(destination) = self.eligible_destination(payee_id).await else {
                report.skipped_payees += 1;
                continue;
            };
            let entries = match self.ctx.ledger.entries(payee_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(%payee_id, error = %e, "could not load ledger entries");
                    report.skipped_payees += 1;
                    continue;
                }
            };

            for entry in entries {
                let outcome = self
                    .dispatch_entry(payee_id, &destination, &entry, &mut remaining)
                    .await;
                report.record(DispatchItem {
                    payee_id,
                    entry_id: entry.id,
                    amount: entry.amount,
                    outcome,
                });
            }
        }

        tracing::info!(
            snapshot = %report.snapshot,
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            held = report.held,
            skipped_payees = report.skipped_payees,
            disbursed = %report.disbursed,
            "dispatch run finished"
        );
        report
    }

    async fn eligible_destination(&self, payee_id: Uuid) -> Option<String> {
        match self.ctx.payees.get(payee_id).await {
            Ok(Some(profile)) if profile.settlement.is_payout_eligible() => {
                profile.settlement.external_payout_account_id
            }
            Ok(_) => {
                tracing::debug!(%payee_id, "payee not payout-eligible, entries left queued");
                None
            }
            Err(e) => {
                tracing::error!(%payee_id, error = %e, "could not load payee profile");
                None
            }
        }
    }

    async fn dispatch_entry(
        &self,
        payee_id: Uuid,
        destination: &str,
        entry: &LedgerEntry,
        remaining: &mut Money,
    ) -> DispatchOutcome {
        let amount = match Amount::new(entry.amount.value()) {
            Ok(amount) if entry.is_structurally_valid() => amount,
            _ => {
                tracing::warn!(%payee_id, entry_id = %entry.id, amount = %entry.amount, source = ?entry.source, "invalid ledger entry skipped");
                return DispatchOutcome::Invalid;
            }
        };

        let linked = match self.linked_commission(entry).await {
            Ok(linked) => linked,
            Err(e) => {
                tracing::error!(%payee_id, entry_id = %entry.id, error = %e, "could not load linked commission");
                return DispatchOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };
        if let Some(commission) = &linked
            && let Some(reason) = hold_reason(commission)
        {
            tracing::warn!(
                %payee_id,
                entry_id = %entry.id,
                commission_id = %commission.id,
                %reason,
                audit = true,
                "payout held for manual review"
            );
            return DispatchOutcome::HeldForReview { reason };
        }

        if entry.amount > *remaining {
            let err = SettlementError::InsufficientLiquidity {
                needed: entry.amount.value(),
                remaining: remaining.value(),
            };
            tracing::debug!(%payee_id, entry_id = %entry.id, reason = %err, "entry deferred");
            return DispatchOutcome::Deferred {
                needed: entry.amount,
                remaining: *remaining,
            };
        }

        let mut metadata = Metadata::new();
        metadata.insert("entry_id".to_string(), entry.id.to_string());
        metadata.insert("payee_id".to_string(), payee_id.to_string());
        if let Some(commission_id) = entry.commission_id {
            metadata.insert("commission_id".to_string(), commission_id.to_string());
        }

        let receipt = match self
            .ctx
            .processor
            .create_transfer(amount, destination, metadata)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::error!(
                    %payee_id,
                    entry_id = %entry.id,
                    destination,
                    amount = %amount,
                    error = %e,
                    "transfer failed, entry kept for retry"
                );
                return DispatchOutcome::Failed {
                    error: SettlementError::from(e).to_string(),
                };
            }
        };

        *remaining -= entry.amount;
        tracing::info!(%payee_id, entry_id = %entry.id, transfer_id = %receipt.id, amount = %amount, "transfer confirmed");

        match self.ctx.ledger.remove(payee_id, &[entry.id]).await {
            Ok(1) => {}
            Ok(_) => {
                tracing::warn!(%payee_id, entry_id = %entry.id, "paid entry was already gone from the queue");
            }
            Err(e) => {
                tracing::error!(
                    %payee_id,
                    entry_id = %entry.id,
                    transfer_id = %receipt.id,
                    error = %e,
                    audit = true,
                    "paid entry could not be removed, remove by hand before the next run"
                );
            }
        }

        if entry.source == EntrySource::CommissionPayout
            && let Some(commission) = linked
        {
            self.complete_commission(commission, &receipt.id).await;
        }

        DispatchOutcome::Transferred {
            transfer_id: receipt.id,
        }
    }

    async fn linked_commission(&self, entry: &LedgerEntry) -> Result<Option<Commission>> {
        match (entry.source, entry.commission_id) {
            (EntrySource::CommissionPayout, Some(id)) => self.ctx.commissions.get(id).await,
            _ => Ok(None),
        }
    }

    /// Missing or already-advanced commissions are logged, not failed.
    async fn complete_commission(&self, commission: Commission, transfer_id: &str) {
        let now = self.ctx.clock.now();
        let result = update_commission(self.ctx.commissions.as_ref(), commission.id, |c| {
            c.settle(transfer_id, now)
        })
        .await;
        match result {
            Ok(saved) => {
                notify(
                    self.ctx.notifier.as_ref(),
                    Notification {
                        recipient: saved.fulfiller_id,
                        commission_id: saved.id,
                        kind: NotificationKind::PayoutSent,
                    },
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(commission_id = %commission.id, transfer_id, error = %e, "transfer made but commission not completed");
            }
        }
    }

    /// Removes invalid and duplicate entries and flags stale ones.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let now = self.ctx.clock.now();
        let stale_before = now - self.policy.retention;
        let mut report = CleanupReport::default();

        for payee_id in self.ctx.ledger.payees_with_entries().await? {
            let entries = match self.ctx.ledger.entries(payee_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(%payee_id, error = %e, "could not load ledger entries for cleanup");
                    continue;
                }
            };

            let mut seen: HashSet<DedupKey> = HashSet::new();
            let mut doomed = Vec::new();
            for entry in &entries {
                let action = if !entry.is_structurally_valid() {
                    Some(CleanupAction::RemovedInvalid)
                } else if let Some(key) = entry.dedup_key()
                    && !seen.insert(key)
                {
                    Some(CleanupAction::RemovedDuplicate)
                } else if entry.created_at < stale_before {
                    Some(CleanupAction::FlaggedStale)
                } else {
                    None
                };
                let Some(action) = action else { continue };

                match action {
                    CleanupAction::RemovedInvalid => {
                        report.invalid_removed += 1;
                        doomed.push(entry.id);
                    }
                    CleanupAction::RemovedDuplicate => {
                        report.duplicates_removed += 1;
                        doomed.push(entry.id);
                    }
                    CleanupAction::FlaggedStale => {
                        report.stale_flagged += 1;
                        tracing::warn!(
                            %payee_id,
                            entry_id = %entry.id,
                            amount = %entry.amount,
                            created_at = %entry.created_at,
                            audit = true,
                            "ledger entry past retention, needs manual review"
                        );
                    }
                }
                report.items.push(CleanupItem {
                    payee_id,
                    entry_id: entry.id,
                    amount: entry.amount,
                    action,
                });
            }

            if !doomed.is_empty() {
                match self.ctx.ledger.remove(payee_id, &doomed).await {
                    Ok(removed) => {
                        tracing::info!(%payee_id, removed, "ledger entries cleaned up");
                    }
                    Err(e) => {
                        tracing::error!(%payee_id, error = %e, "could not remove ledger entries");
                    }
                }
            }
        }

        self.ctx.watermarks.set(CLEANUP_WATERMARK, now).await?;
        tracing::info!(
            invalid_removed = report.invalid_removed,
            duplicates_removed = report.duplicates_removed,
            stale_flagged = report.stale_flagged,
            "ledger cleanup finished"
        );
        Ok(report)
    }

    /// Runs [`cleanup`](Self::cleanup) unless the last pass is younger than the policy interval.
    pub async fn cleanup_if_due(&self) -> Result<Option<CleanupReport>> {
        let now = self.ctx.clock.now();
        if let Some(last) = self.ctx.watermarks.get(CLEANUP_WATERMARK).await?
            && now - last < self.policy.interval
        {
            tracing::debug!(%last, "ledger cleanup not due");
            return Ok(None);
        }
        self.cleanup().await.map(Some)
    }
}

/// A commission payout is only ever paid out of `cron_pending`.
fn hold_reason(commission: &Commission) -> Option<String> {
    if let Some(t) = &commission.transfer_id {
        return Some(format!("commission {} already paid by {t}", commission.id));
    }
    if let Some(review) = &commission.review_reason {
        return Some(format!("commission {} flagged for review: {review}", commission.id));
    }
    match commission.status {
        CommissionStatus::CronPending => None,
        CommissionStatus::Cancelled => Some(format!("commission {} was cancelled", commission.id)),
        status => Some(format!(
            "commission {} is {status}, not awaiting payout",
            commission.id
        )),
    }
}
