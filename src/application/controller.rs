use super::{SettlementContext, notify, update_commission};
use crate::domain::commission::{Actor, Commission, CommissionEvent, CommissionStatus};
use crate::domain::events::{CheckoutSession, CheckoutSubject, Notification, NotificationKind};
use crate::domain::ledger::{EntrySource, LedgerEntry};
use crate::domain::money::{Amount, Money};
use crate::domain::ports::AppendOutcome;
use crate::error::{Result, SettlementError};
use uuid::Uuid;

/// Request to open a commission with a fulfiller.
#[derive(Debug, Clone)]
pub struct NewCommission {
    pub requester_id: Uuid,
    pub fulfiller_id: Uuid,
    pub fulfiller_price: Amount,
    pub max_revisions: u32,
    pub guide_asset: Option<String>,
}

/// Front controller for actor-initiated commission transitions.
///
/// Every transition goes through `CommissionStatus::apply` inside an
/// optimistic write, so a request racing a background task either wins
/// cleanly or fails with `IllegalTransition` against the fresh state.
pub struct CommissionController {
    ctx: SettlementContext,
}

impl CommissionController {
    pub fn new(ctx: SettlementContext) -> Self {
        Self { ctx }
    }

    pub async fn create_commission(&self, request: NewCommission) -> Result<Commission> {
        if request.requester_id == request.fulfiller_id {
            return Err(SettlementError::ValidationError(
                "requester and fulfiller must be different users".to_string(),
            ));
        }
        let fulfiller = self
            .ctx
            .payees
            .get(request.fulfiller_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("fulfiller {}", request.fulfiller_id)))?;

        let mut commission = Commission::new(
            request.requester_id,
            request.fulfiller_id,
            request.fulfiller_price.into(),
            fulfiller.tier,
            request.max_revisions,
            self.ctx.clock.now(),
        );
        commission.deliverables.guide_asset = request.guide_asset;

        let commission = self.ctx.commissions.insert(commission).await?;
        tracing::info!(
            commission_id = %commission.id,
            requester_id = %commission.requester_id,
            fulfiller_id = %commission.fulfiller_id,
            fulfiller_price = %commission.fulfiller_price,
            requester_price = %commission.requester_price,
            "commission created"
        );
        Ok(commission)
    }

    pub async fn get(&self, id: Uuid) -> Result<Commission> {
        self.ctx
            .commissions
            .get(id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("commission {id}")))
    }

    pub async fn list_for_requester(&self, requester_id: Uuid) -> Result<Vec<Commission>> {
        self.ctx.commissions.list_by_requester(requester_id).await
    }

    pub async fn list_for_fulfiller(&self, fulfiller_id: Uuid) -> Result<Vec<Commission>> {
        self.ctx.commissions.list_by_fulfiller(fulfiller_id).await
    }

    /// Fulfiller takes the job. Requires a payout-eligible settlement profile.
    pub async fn accept(&self, actor: Actor, id: Uuid) -> Result<Commission> {
        let commission = self.get(id).await?;
        require_fulfiller(actor, &commission)?;
        commission.status.apply(CommissionEvent::Accept)?;

        let eligible = self
            .ctx
            .payees
            .get(commission.fulfiller_id)
            .await?
            .is_some_and(|p| p.settlement.is_payout_eligible());
        if !eligible {
            return Err(SettlementError::IneligiblePayee(commission.fulfiller_id));
        }

        let now = self.ctx.clock.now();
        let saved = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            c.advance(CommissionEvent::Accept, now)
        })
        .await?;
        tracing::info!(commission_id = %id, "commission accepted");
        self.tell(saved.requester_id, id, NotificationKind::Accepted).await;
        Ok(saved)
    }

    pub async fn reject(&self, actor: Actor, id: Uuid, reason: Option<String>) -> Result<Commission> {
        let commission = self.get(id).await?;
        require_fulfiller(actor, &commission)?;

        let now = self.ctx.clock.now();
        let saved = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            c.advance(CommissionEvent::Reject, now)?;
            c.cancellation_reason = reason.clone();
            Ok(())
        })
        .await?;
        tracing::info!(commission_id = %id, "commission rejected by fulfiller");
        self.tell(saved.requester_id, id, NotificationKind::Rejected).await;
        Ok(saved)
    }

    /// Opens a processor checkout for the requester price.
    pub async fn begin_checkout(&self, actor: Actor, id: Uuid) -> Result<CheckoutSession> {
        let commission = self.get(id).await?;
        require_requester(actor, &commission)?;
        ensure_awaiting_payment(&commission)?;

        let amount = Amount::new(commission.requester_price.value())?;
        let metadata = CheckoutSubject::Commission { commission_id: id }.to_metadata();
        let session = self.ctx.processor.create_checkout(amount, metadata).await?;

        let now = self.ctx.clock.now();
        update_commission(self.ctx.commissions.as_ref(), id, |c| {
            ensure_awaiting_payment(c)?;
            c.checkout_session_id = Some(session.id.clone());
            c.updated_at = now;
            Ok(())
        })
        .await?;
        tracing::info!(commission_id = %id, session_id = %session.id, amount = %amount, "checkout opened");
        Ok(session)
    }

    pub async fn deliver(
        &self,
        actor: Actor,
        id: Uuid,
        finished_asset: String,
        preview_asset: Option<String>,
    ) -> Result<Commission> {
        let commission = self.get(id).await?;
        require_fulfiller(actor, &commission)?;

        let now = self.ctx.clock.now();
        let saved = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            c.advance(CommissionEvent::Deliver, now)?;
            c.deliverables.finished_asset = Some(finished_asset.clone());
            c.deliverables.preview_asset = preview_asset.clone();
            Ok(())
        })
        .await?;
        tracing::info!(commission_id = %id, revision = saved.revision_count, "commission delivered");
        self.tell(saved.requester_id, id, NotificationKind::Delivered).await;
        Ok(saved)
    }

    /// Requester accepts the delivery; the payout is queued immediately.
    pub async fn approve(&self, actor: Actor, id: Uuid) -> Result<Commission> {
        let commission = self.get(id).await?;
        require_requester(actor, &commission)?;

        let now = self.ctx.clock.now();
        let approved = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            c.advance(CommissionEvent::Approve, now)
        })
        .await?;
        tracing::info!(commission_id = %id, "commission approved");
        self.tell(approved.fulfiller_id, id, NotificationKind::Approved).await;

        self.enqueue_payout(approved).await
    }

    pub async fn request_revision(&self, actor: Actor, id: Uuid) -> Result<Commission> {
        let commission = self.get(id).await?;
        require_requester(actor, &commission)?;

        let now = self.ctx.clock.now();
        let saved = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            c.status.apply(CommissionEvent::RequestRevision)?;
            if c.revision_count >= c.max_revisions {
                return Err(SettlementError::RevisionLimitExceeded {
                    max: c.max_revisions,
                });
            }
            c.advance(CommissionEvent::RequestRevision, now)?;
            c.revision_count += 1;
            Ok(())
        })
        .await?;
        tracing::info!(
            commission_id = %id,
            revision_count = saved.revision_count,
            max_revisions = saved.max_revisions,
            "revision requested"
        );
        self.tell(saved.fulfiller_id, id, NotificationKind::RevisionRequested)
            .await;
        Ok(saved)
    }

    /// Cancels before payment, or after delivery with a refund.
    pub async fn cancel(&self, actor: Actor, id: Uuid, reason: String) -> Result<Commission> {
        let commission = self.get(id).await?;
        require_requester(actor, &commission)?;
        commission.status.apply(CommissionEvent::Cancel)?;

        if commission.status.is_pre_payment() {
            return self.cancel_unpaid(id, reason).await;
        }

        // Delivered: money has moved, refund before touching state.
        if let Some(payment_id) = commission.payment_confirmation_id.as_deref() {
            let mut metadata = CheckoutSubject::Commission { commission_id: id }.to_metadata();
            metadata.insert("reason".to_string(), reason.clone());
            let refund = self
                .ctx
                .processor
                .create_refund(payment_id, metadata)
                .await
                .inspect_err(|e| {
                    tracing::error!(commission_id = %id, payment_id, error = %e, "refund failed, commission left unchanged");
                })?;
            tracing::info!(commission_id = %id, refund_id = %refund.id, "refund issued");
        } else {
            tracing::warn!(commission_id = %id, "delivered commission has no payment on record, cancelling without refund");
        }

        // The refund is out; a state that moved meanwhile is overridden and flagged.
        let now = self.ctx.clock.now();
        let saved = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            c.cancel_after_refund(CommissionEvent::Cancel, &reason, now);
            Ok(())
        })
        .await
        .inspect_err(|e| {
            tracing::error!(commission_id = %id, error = %e, audit = true, "refund issued but cancellation could not be recorded");
        })?;
        if let Some(review) = &saved.review_reason {
            tracing::warn!(commission_id = %id, status = %saved.status, %review, audit = true, "refund raced another transition, flagged for review");
        }
        if saved.status == CommissionStatus::Cancelled {
            self.tell(saved.fulfiller_id, id, NotificationKind::Cancelled { reason })
                .await;
        }
        Ok(saved)
    }

    async fn cancel_unpaid(&self, id: Uuid, reason: String) -> Result<Commission> {
        let now = self.ctx.clock.now();
        let saved = update_commission(self.ctx.commissions.as_ref(), id, |c| {
            if c.payment_confirmation_id.is_some() {
                return Err(SettlementError::IllegalTransition {
                    from: c.status,
                    event: CommissionEvent::Cancel,
                });
            }
            c.advance(CommissionEvent::Cancel, now)?;
            c.cancellation_reason = Some(reason.clone());
            Ok(())
        })
        .await?;
        tracing::info!(commission_id = %id, "commission cancelled before payment");
        self.tell(saved.fulfiller_id, id, NotificationKind::Cancelled { reason })
            .await;
        Ok(saved)
    }

    /// Physically removes a same-day, never-paid request.
    pub async fn delete_unpaid(&self, actor: Actor, id: Uuid) -> Result<()> {
        let commission = self.get(id).await?;
        require_requester(actor, &commission)?;

        let now = self.ctx.clock.now();
        let deletable = commission.status.is_pre_payment()
            && commission.payment_confirmation_id.is_none()
            && commission.created_at.date_naive() == now.date_naive();
        if !deletable {
            return Err(SettlementError::Forbidden(format!(
                "commission {id} can only be deleted on the day it was created and before payment"
            )));
        }
        if !self.ctx.commissions.delete(&commission).await? {
            let current = self.get(id).await?;
            return Err(SettlementError::IllegalTransition {
                from: current.status,
                event: CommissionEvent::Cancel,
            });
        }
        tracing::info!(commission_id = %id, "unpaid commission deleted");
        Ok(())
    }

    /// Administrative push of an approved or delivered commission into the
    /// payout queue.
    pub async fn queue_payout(&self, actor: Actor, id: Uuid) -> Result<Commission> {
        if actor != Actor::Admin {
            return Err(SettlementError::Forbidden(
                "only administrators can queue payouts directly".to_string(),
            ));
        }
        let commission = self.get(id).await?;
        commission.status.apply(CommissionEvent::QueuePayout)?;
        self.enqueue_payout(commission).await
    }

    /// Check-then-insert of the payout entry, then `-> cron_pending`.
    async fn enqueue_payout(&self, commission: Commission) -> Result<Commission> {
        let id = commission.id;
        let now = self.ctx.clock.now();
        let amount = Amount::new(commission.fulfiller_price.value())?;
        let mut entry = LedgerEntry::new(
            Money::from(amount),
            EntrySource::CommissionPayout,
            format!("Commission {id} payout"),
            now,
        )
        .for_commission(id);
        if let Some(payment_id) = &commission.payment_confirmation_id {
            entry = entry.with_payment(payment_id.clone());
        }
        let entry_id = entry.id;

        let outcome = self.ctx.ledger.append(commission.fulfiller_id, entry).await?;
        let advance = |c: &mut Commission| {
            if c.status == CommissionStatus::CronPending {
                return Ok(());
            }
            c.advance(CommissionEvent::QueuePayout, now)
        };

        match outcome {
            AppendOutcome::Appended => {
                let saved = match update_commission(self.ctx.commissions.as_ref(), id, advance).await {
                    Ok(saved) => saved,
                    Err(e) => {
                        self.withdraw_entry(commission.fulfiller_id, id, entry_id).await;
                        return Err(e);
                    }
                };
                tracing::info!(
                    commission_id = %id,
                    payee_id = %commission.fulfiller_id,
                    %entry_id,
                    amount = %amount,
                    "payout queued"
                );
                Ok(saved)
            }
            AppendOutcome::AlreadyQueued | AppendOutcome::Duplicate => {
                // An earlier attempt queued the entry but may have died before
                // the state write; finish it so the dispatcher can settle.
                if let Err(e) = update_commission(self.ctx.commissions.as_ref(), id, advance).await {
                    tracing::warn!(commission_id = %id, error = %e, "could not repair state of already-queued payout");
                }
                Err(SettlementError::AlreadyQueued(id))
            }
        }
    }

    /// Takes back a payout entry whose state write lost.
    async fn withdraw_entry(&self, payee_id: Uuid, commission_id: Uuid, entry_id: Uuid) {
        match self.ctx.ledger.remove(payee_id, &[entry_id]).await {
            Ok(_) => {
                tracing::info!(%commission_id, %payee_id, %entry_id, "payout entry withdrawn, commission moved on");
            }
            Err(e) => {
                // The dispatcher holds it: the commission is not cron_pending.
                tracing::error!(%commission_id, %payee_id, %entry_id, error = %e, audit = true, "could not withdraw payout entry");
            }
        }
    }

    async fn tell(&self, recipient: Uuid, commission_id: Uuid, kind: NotificationKind) {
        notify(
            self.ctx.notifier.as_ref(),
            Notification {
                recipient,
                commission_id,
                kind,
            },
        )
        .await;
    }
}

fn require_fulfiller(actor: Actor, commission: &Commission) -> Result<()> {
    match actor {
        Actor::User(user) if user == commission.fulfiller_id => Ok(()),
        _ => Err(SettlementError::Forbidden(format!(
            "only the fulfiller of commission {} may do this",
            commission.id
        ))),
    }
}

/// Requester, or an administrator acting on their behalf.
fn require_requester(actor: Actor, commission: &Commission) -> Result<()> {
    match actor {
        Actor::Admin => Ok(()),
        Actor::User(user) if user == commission.requester_id => Ok(()),
        _ => Err(SettlementError::Forbidden(format!(
            "only the requester of commission {} may do this",
            commission.id
        ))),
    }
}

fn ensure_awaiting_payment(commission: &Commission) -> Result<()> {
    if commission.status != CommissionStatus::Requested || commission.payment_confirmation_id.is_some() {
        return Err(SettlementError::IllegalTransition {
            from: commission.status,
            event: CommissionEvent::PaymentConfirmed,
        });
    }
    Ok(())
}
