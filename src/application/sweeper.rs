use super::{SettlementContext, notify, update_commission};
use crate::domain::commission::{Commission, CommissionEvent, CommissionStatus};
use crate::domain::events::{Metadata, Notification, NotificationKind};
use crate::domain::sla::parse_delivery_time;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const REASON_UNPAID: &str = "expired: no payment to refund";
pub const REASON_UNCAPTURED: &str = "expired: payment authorized but never captured, nothing to refund";
pub const REASON_REFUNDED: &str = "expired: payment refunded";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    Refunded { refund_id: String },
    CancelledUncaptured,
    CancelledUnpaid,
    /// Refund call failed; commission left in flight for the next sweep.
    RefundFailed { error: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepItem {
    pub commission_id: Uuid,
    pub expired_at: DateTime<Utc>,
    pub outcome: SweepOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub items: Vec<SweepItem>,
}

/// Cancels in-flight commissions whose delivery window has passed.
pub struct ExpirySweeper {
    ctx: SettlementContext,
}

impl ExpirySweeper {
    pub fn new(ctx: SettlementContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<SweepReport> {
        let now = self.ctx.clock.now();
        let in_flight = self.ctx.commissions.list_in_flight().await?;
        let mut report = SweepReport {
            scanned: in_flight.len(),
            ..Default::default()
        };

        for commission in in_flight {
            let sla = match self.delivery_window(commission.fulfiller_id).await {
                Ok(sla) => sla,
                Err(e) => {
                    tracing::error!(commission_id = %commission.id, error = %e, "could not load fulfiller SLA");
                    report.items.push(SweepItem {
                        commission_id: commission.id,
                        expired_at: commission.created_at,
                        outcome: SweepOutcome::Failed {
                            error: e.to_string(),
                        },
                    });
                    continue;
                }
            };
            let Some(expires_at) = commission.expires_at(sla) else {
                tracing::debug!(commission_id = %commission.id, sla = %sla, "delivery window never closes");
                continue;
            };
            if now <= expires_at {
                continue;
            }

            let commission_id = commission.id;
            let outcome = self.expire(commission).await;
            report.items.push(SweepItem {
                commission_id,
                expired_at: expires_at,
                outcome,
            });
        }

        tracing::info!(
            scanned = report.scanned,
            expired = report.items.len(),
            refunded = report
                .items
                .iter()
                .filter(|i| matches!(i.outcome, SweepOutcome::Refunded { .. }))
                .count(),
            "expiry sweep finished"
        );
        Ok(report)
    }

    async fn delivery_window(&self, fulfiller_id: Uuid) -> Result<Duration> {
        let profile = self.ctx.payees.get(fulfiller_id).await?;
        Ok(parse_delivery_time(
            profile.as_ref().and_then(|p| p.delivery_time.as_deref()),
        ))
    }

    async fn expire(&self, commission: Commission) -> SweepOutcome {
        let id = commission.id;
        let Some(payment_id) = commission.payment_confirmation_id.clone() else {
            return self
                .cancel(&commission, REASON_UNPAID, SweepOutcome::CancelledUnpaid)
                .await;
        };

        let payment = match self.ctx.processor.retrieve_payment(&payment_id).await {
            Ok(payment) => payment,
            Err(e) => {
                tracing::error!(commission_id = %id, payment_id, error = %e, "could not read payment state");
                return SweepOutcome::Failed {
                    error: SettlementError::from(e).to_string(),
                };
            }
        };
        if !payment.captured {
            return self
                .cancel(&commission, REASON_UNCAPTURED, SweepOutcome::CancelledUncaptured)
                .await;
        }

        // The record may have moved while the processor was being asked.
        match self.ctx.commissions.get(id).await {
            Ok(Some(current))
                if current.status.apply(CommissionEvent::Expire).is_ok()
                    && current.payment_confirmation_id.as_deref() == Some(payment_id.as_str()) => {}
            Ok(current) => {
                let from = current.map_or(commission.status, |c| c.status);
                tracing::info!(commission_id = %id, status = %from, "commission moved before refund, left alone");
                return SweepOutcome::Failed {
                    error: SettlementError::IllegalTransition {
                        from,
                        event: CommissionEvent::Expire,
                    }
                    .to_string(),
                };
            }
            Err(e) => {
                tracing::error!(commission_id = %id, error = %e, "could not re-read commission before refund");
                return SweepOutcome::Failed {
                    error: e.to_string(),
                };
            }
        }

        let mut metadata = Metadata::new();
        metadata.insert("commission_id".to_string(), id.to_string());
        metadata.insert("reason".to_string(), "expired".to_string());
        match self.ctx.processor.create_refund(&payment_id, metadata).await {
            Ok(refund) => {
                tracing::info!(commission_id = %id, payment_id, refund_id = %refund.id, "expired commission refunded");
                self.cancel_refunded(&commission, refund.id).await
            }
            Err(e) => {
                tracing::error!(commission_id = %id, payment_id, error = %e, "refund failed, commission left in flight");
                SweepOutcome::RefundFailed {
                    error: SettlementError::from(e).to_string(),
                }
            }
        }
    }

    /// Money has left; the cancellation is recorded whatever the record did meanwhile.
    async fn cancel_refunded(&self, commission: &Commission, refund_id: String) -> SweepOutcome {
        let now = self.ctx.clock.now();
        let result = update_commission(self.ctx.commissions.as_ref(), commission.id, |c| {
            c.cancel_after_refund(CommissionEvent::Expire, REASON_REFUNDED, now);
            Ok(())
        })
        .await;

        match result {
            Ok(saved) => {
                if let Some(review) = &saved.review_reason {
                    tracing::warn!(commission_id = %saved.id, %refund_id, review = %review, audit = true, "refund raced another transition, flagged for review");
                }
                if saved.status == CommissionStatus::Cancelled {
                    self.tell_parties(&saved, REASON_REFUNDED).await;
                }
                SweepOutcome::Refunded { refund_id }
            }
            Err(e) => {
                tracing::error!(
                    commission_id = %commission.id,
                    %refund_id,
                    error = %e,
                    audit = true,
                    "refund issued but cancellation could not be recorded"
                );
                SweepOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn tell_parties(&self, saved: &Commission, reason: &str) {
        for recipient in [saved.requester_id, saved.fulfiller_id] {
            notify(
                self.ctx.notifier.as_ref(),
                Notification {
                    recipient,
                    commission_id: saved.id,
                    kind: NotificationKind::Expired {
                        reason: reason.to_string(),
                    },
                },
            )
            .await;
        }
    }

    async fn cancel(&self, commission: &Commission, reason: &str, success: SweepOutcome) -> SweepOutcome {
        let now = self.ctx.clock.now();
        let result = update_commission(self.ctx.commissions.as_ref(), commission.id, |c| {
            c.advance(CommissionEvent::Expire, now)?;
            c.cancellation_reason = Some(reason.to_string());
            Ok(())
        })
        .await;

        match result {
            Ok(saved) => {
                tracing::info!(commission_id = %saved.id, reason, "commission expired");
                self.tell_parties(&saved, reason).await;
                success
            }
            Err(e) => {
                tracing::error!(
                    commission_id = %commission.id,
                    error = %e,
                    "could not cancel expired commission"
                );
                SweepOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}
