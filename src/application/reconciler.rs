use super::{SettlementContext, notify, update_commission};
use crate::domain::commission::{Commission, CommissionEvent, CommissionStatus};
use crate::domain::events::{CheckoutCompleted, CheckoutSubject, Notification, NotificationKind};
use crate::domain::ledger::{EntrySource, LedgerEntry};
use crate::domain::money::Amount;
use crate::domain::ports::AppendOutcome;
use crate::error::{Result, SettlementError};
use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

pub const RECONCILE_WATERMARK: &str = "last_reconcile_at";

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How far back the pull sweep asks the processor for completed checkouts
    /// when no earlier sweep is on record.
    pub lookback: Duration,
    /// Overlap with the previous sweep so that events landing at the boundary
    /// are seen twice rather than never.
    pub overlap: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::hours(24),
            overlap: Duration::minutes(15),
        }
    }
}

/// What applying one payment event did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Payment recorded and the commission moved to `in_progress`.
    Advanced { commission_id: Uuid },
    /// Payment recorded; the commission was not in a state to advance.
    Recorded { commission_id: Uuid, status: CommissionStatus },
    /// Seller share of a purchase queued.
    Credited { payee_id: Uuid, entry_id: Uuid },
    /// Already reflected locally. Absorbed.
    Duplicate,
    /// Could not be mapped or applied. Logged for manual audit.
    Dropped { reason: String },
    /// Transient local failure; the next sweep will replay it.
    Failed { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub items: Vec<(String, ReconcileOutcome)>,
}

impl ReconcileReport {
    pub fn count(&self, pred: impl Fn(&ReconcileOutcome) -> bool) -> usize {
        self.items.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Applies externally confirmed payments to local state.
///
/// The webhook path and the periodic history sweep both land in
/// [`SettlementReconciler::reconcile`]; the payment confirmation id is the
/// only dedup key.
pub struct SettlementReconciler {
    ctx: SettlementContext,
    config: ReconcilerConfig,
}

impl SettlementReconciler {
    pub fn new(ctx: SettlementContext, config: ReconcilerConfig) -> Self {
        Self { ctx, config }
    }

    /// Push entry point, called inline from the webhook handler. Never fails.
    pub async fn handle_checkout_completed(&self, event: CheckoutCompleted) -> ReconcileOutcome {
        let outcome = self.reconcile(&event).await;
        tracing::info!(session_id = %event.session_id, outcome = ?outcome, "webhook reconciled");
        outcome
    }

    /// Pull entry point: replays the processor's recent completed checkouts.
    pub async fn sweep_recent(&self) -> Result<ReconcileReport> {
        let now = self.ctx.clock.now();
        let since = match self.ctx.watermarks.get(RECONCILE_WATERMARK).await? {
            Some(last) => last - self.config.overlap,
            None => now - self.config.lookback,
        };

        let events = self
            .ctx
            .processor
            .list_completed_checkouts(since)
            .await
            .inspect_err(|e| tracing::error!(%since, error = %e, "could not list completed checkouts"))?;

        let mut report = ReconcileReport {
            scanned: events.len(),
            ..Default::default()
        };
        // Never move past an event that still has to be replayed.
        let mut watermark = now;
        for event in &events {
            let outcome = self.reconcile(event).await;
            if matches!(outcome, ReconcileOutcome::Failed { .. }) {
                watermark = watermark.min(event.completed_at);
            }
            report.items.push((event.session_id.clone(), outcome));
        }

        if watermark < now {
            tracing::warn!(%watermark, "watermark held back for failed events");
        }
        self.ctx.watermarks.set(RECONCILE_WATERMARK, watermark).await?;
        tracing::info!(
            %since,
            scanned = report.scanned,
            advanced = report.count(|o| matches!(o, ReconcileOutcome::Advanced { .. })),
            credited = report.count(|o| matches!(o, ReconcileOutcome::Credited { .. })),
            duplicates = report.count(|o| matches!(o, ReconcileOutcome::Duplicate)),
            dropped = report.count(|o| matches!(o, ReconcileOutcome::Dropped { .. })),
            failed = report.count(|o| matches!(o, ReconcileOutcome::Failed { .. })),
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    /// Shared idempotent application of one completed checkout.
    pub async fn reconcile(&self, event: &CheckoutCompleted) -> ReconcileOutcome {
        let Some(payment_id) = event.payment_confirmation_id.as_deref() else {
            return dropped(event, "event carries no payment confirmation id");
        };

        match self.resolve_commission(event, payment_id).await {
            Ok(Some(commission)) => return self.apply_to_commission(commission, payment_id).await,
            Ok(None) => {}
            Err(e) => return failed(event, e),
        }

        match event.subject() {
            Some(CheckoutSubject::Purchase {
                payee_id,
                payee_amount,
                reference,
            }) => {
                self.credit_purchase(event, payment_id, payee_id, payee_amount, reference)
                    .await
            }
            Some(CheckoutSubject::Commission { commission_id }) => dropped(
                event,
                &SettlementError::UnresolvableEvent(format!("commission {commission_id} does not exist"))
                    .to_string(),
            ),
            None => dropped(
                event,
                &SettlementError::UnresolvableEvent("no local record matches session or metadata".to_string())
                    .to_string(),
            ),
        }
    }

    /// Session id first, then the payment id already on record, then the
    /// commission id from metadata.
    async fn resolve_commission(&self, event: &CheckoutCompleted, payment_id: &str) -> Result<Option<Commission>> {
        if let Some(found) = self
            .ctx
            .commissions
            .find_by_checkout_session(&event.session_id)
            .await?
        {
            return Ok(Some(found));
        }
        if let Some(found) = self.ctx.commissions.find_by_payment(payment_id).await? {
            return Ok(Some(found));
        }
        match event.subject() {
            Some(CheckoutSubject::Commission { commission_id }) => {
                self.ctx.commissions.get(commission_id).await
            }
            _ => Ok(None),
        }
    }

    async fn apply_to_commission(&self, commission: Commission, payment_id: &str) -> ReconcileOutcome {
        let id = commission.id;
        if commission.payment_confirmation_id.as_deref() == Some(payment_id) {
            tracing::debug!(commission_id = %id, payment_id, "payment already reflected");
            return ReconcileOutcome::Duplicate;
        }

        let now = self.ctx.clock.now();
        let mut advanced = false;
        let result = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            c.record_payment(payment_id)?;
            c.updated_at = now;
            // Only pre-payment states move; anything later was reached by a
            // duplicate or out-of-order event and must not regress.
            advanced = c.status == CommissionStatus::Requested;
            if advanced {
                c.advance(CommissionEvent::PaymentConfirmed, now)?;
            }
            Ok(())
        })
        .await;

        match result {
            Ok(saved) if advanced => {
                tracing::info!(commission_id = %id, payment_id, "payment confirmed, commission in progress");
                notify(
                    self.ctx.notifier.as_ref(),
                    Notification {
                        recipient: saved.fulfiller_id,
                        commission_id: id,
                        kind: NotificationKind::PaymentReceived,
                    },
                )
                .await;
                ReconcileOutcome::Advanced { commission_id: id }
            }
            Ok(saved) => {
                tracing::warn!(
                    commission_id = %id,
                    payment_id,
                    status = %saved.status,
                    audit = true,
                    "payment recorded without state change"
                );
                ReconcileOutcome::Recorded {
                    commission_id: id,
                    status: saved.status,
                }
            }
            Err(SettlementError::DuplicateSettlementEvent(_)) => ReconcileOutcome::Duplicate,
            Err(SettlementError::ValidationError(reason)) => {
                tracing::warn!(commission_id = %id, payment_id, %reason, audit = true, "conflicting payment for commission, dropped");
                ReconcileOutcome::Dropped { reason }
            }
            Err(e) => {
                tracing::error!(commission_id = %id, payment_id, error = %e, "could not apply payment, will retry on next sweep");
                ReconcileOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn credit_purchase(
        &self,
        event: &CheckoutCompleted,
        payment_id: &str,
        payee_id: Uuid,
        amount: Amount,
        reference: String,
    ) -> ReconcileOutcome {
        let entry = LedgerEntry::new(
            amount.into(),
            EntrySource::CheckoutPurchase,
            reference,
            self.ctx.clock.now(),
        )
        .with_payment(payment_id)
        .with_metadata("checkout_session_id", event.session_id.clone());
        let entry_id = entry.id;

        match self.ctx.ledger.append(payee_id, entry).await {
            Ok(AppendOutcome::Appended) => {
                tracing::info!(%payee_id, %entry_id, payment_id, amount = %amount, "purchase credited");
                ReconcileOutcome::Credited { payee_id, entry_id }
            }
            Ok(_) => {
                tracing::debug!(%payee_id, payment_id, "purchase already credited");
                ReconcileOutcome::Duplicate
            }
            Err(e) => failed(event, e),
        }
    }
}

fn dropped(event: &CheckoutCompleted, reason: &str) -> ReconcileOutcome {
    tracing::warn!(
        session_id = %event.session_id,
        payment_id = ?event.payment_confirmation_id,
        metadata = ?event.metadata,
        reason,
        audit = true,
        "payment event dropped"
    );
    ReconcileOutcome::Dropped {
        reason: reason.to_string(),
    }
}

fn failed(event: &CheckoutCompleted, error: SettlementError) -> ReconcileOutcome {
    tracing::error!(session_id = %event.session_id, error = %error, "payment event not applied, will retry on next sweep");
    ReconcileOutcome::Failed {
        error: error.to_string(),
    }
}
