use super::money::Money;
use crate::error::SettlementError;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle states of a commission.
///
/// `RejectedByArtist`, `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    PendingArtist,
    RejectedByArtist,
    Requested,
    InProgress,
    Delivered,
    Approved,
    CronPending,
    Completed,
    Cancelled,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::PendingArtist => "pending_artist",
            CommissionStatus::RejectedByArtist => "rejected_by_artist",
            CommissionStatus::Requested => "requested",
            CommissionStatus::InProgress => "in_progress",
            CommissionStatus::Delivered => "delivered",
            CommissionStatus::Approved => "approved",
            CommissionStatus::CronPending => "cron_pending",
            CommissionStatus::Completed => "completed",
            CommissionStatus::Cancelled => "cancelled",
        }
    }

    /// States in which no payment can have been captured yet.
    pub fn is_pre_payment(&self) -> bool {
        matches!(
            self,
            CommissionStatus::PendingArtist | CommissionStatus::Requested
        )
    }

    /// States patrolled by the expiry sweeper.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            CommissionStatus::Requested | CommissionStatus::InProgress
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommissionStatus::RejectedByArtist
                | CommissionStatus::Completed
                | CommissionStatus::Cancelled
        )
    }

    /// The single authority on legal edges of the commission state machine.
    ///
    /// Returns the next state, or `IllegalTransition` when `event` has no edge
    /// out of `self`. Preconditions that depend on more than the state (actor,
    /// revision budget, payment presence) are checked by the callers.
    pub fn apply(self, event: CommissionEvent) -> Result<CommissionStatus, SettlementError> {
        use CommissionEvent as E;
        use CommissionStatus as S;

        let next = match (self, event) {
            (S::PendingArtist, E::Accept) => S::Requested,
            (S::PendingArtist, E::Reject) => S::RejectedByArtist,
            (S::Requested, E::PaymentConfirmed) => S::InProgress,
            (S::InProgress, E::Deliver) => S::Delivered,
            (S::Delivered, E::Approve) => S::Approved,
            (S::Delivered, E::RequestRevision) => S::InProgress,
            (S::Delivered, E::Cancel) => S::Cancelled,
            (S::Approved | S::Delivered, E::QueuePayout) => S::CronPending,
            (S::CronPending, E::PayoutSettled) => S::Completed,
            (S::PendingArtist | S::Requested, E::Cancel) => S::Cancelled,
            (S::Requested | S::InProgress, E::Expire) => S::Cancelled,
            (from, event) => return Err(SettlementError::IllegalTransition { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for CommissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionEvent {
    Accept,
    Reject,
    PaymentConfirmed,
    Deliver,
    Approve,
    RequestRevision,
    Cancel,
    Expire,
    QueuePayout,
    PayoutSettled,
}

impl fmt::Display for CommissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommissionEvent::Accept => "accept",
            CommissionEvent::Reject => "reject",
            CommissionEvent::PaymentConfirmed => "payment_confirmed",
            CommissionEvent::Deliver => "deliver",
            CommissionEvent::Approve => "approve",
            CommissionEvent::RequestRevision => "request_revision",
            CommissionEvent::Cancel => "cancel",
            CommissionEvent::Expire => "expire",
            CommissionEvent::QueuePayout => "queue_payout",
            CommissionEvent::PayoutSettled => "payout_settled",
        };
        f.write_str(name)
    }
}

/// Who is driving a controller call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(Uuid),
    Admin,
}

/// Fulfiller subscription tier; decides the platform margin on new commissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Studio,
}

impl SubscriptionTier {
    pub fn margin_rate(&self) -> Decimal {
        match self {
            SubscriptionTier::Free => dec!(0.15),
            SubscriptionTier::Pro => dec!(0.10),
            SubscriptionTier::Studio => dec!(0.05),
        }
    }
}

/// Requester-facing price for a given fulfiller price and margin rate.
pub fn requester_price(fulfiller_price: Money, margin_rate: Decimal) -> Money {
    Money::new(fulfiller_price.value() * (Decimal::ONE + margin_rate)).round_cents()
}

/// Asset references attached to a commission. Upload and storage live elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deliverables {
    pub finished_asset: Option<String>,
    pub preview_asset: Option<String>,
    pub guide_asset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commission {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub fulfiller_id: Uuid,
    pub fulfiller_price: Money,
    pub requester_price: Money,
    pub status: CommissionStatus,
    pub revision_count: u32,
    pub max_revisions: u32,
    pub cancellation_reason: Option<String>,
    pub checkout_session_id: Option<String>,
    pub payment_confirmation_id: Option<String>,
    pub transfer_id: Option<String>,
    pub deliverables: Deliverables,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when money moved in a way the state machine could not record.
    /// Flagged records are never paid out automatically.
    #[serde(default)]
    pub review_reason: Option<String>,
    /// Optimistic concurrency token, bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Commission {
    pub fn new(
        requester_id: Uuid,
        fulfiller_id: Uuid,
        fulfiller_price: Money,
        tier: SubscriptionTier,
        max_revisions: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id,
            fulfiller_id,
            fulfiller_price,
            requester_price: requester_price(fulfiller_price, tier.margin_rate()),
            status: CommissionStatus::PendingArtist,
            revision_count: 0,
            max_revisions,
            cancellation_reason: None,
            checkout_session_id: None,
            payment_confirmation_id: None,
            transfer_id: None,
            deliverables: Deliverables::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            review_reason: None,
            version: 0,
        }
    }

    pub fn is_party(&self, user: Uuid) -> bool {
        self.requester_id == user || self.fulfiller_id == user
    }

    /// Expiry instant for a given delivery SLA. Derived, never stored.
    ///
    /// `None` when the SLA reaches past the representable calendar, i.e. the
    /// commission never expires.
    pub fn expires_at(&self, sla: Duration) -> Option<DateTime<Utc>> {
        self.created_at.checked_add_signed(sla)
    }

    /// Moves the record along one edge of the state machine.
    pub fn advance(&mut self, event: CommissionEvent, now: DateTime<Utc>) -> Result<(), SettlementError> {
        let next = self.status.apply(event)?;
        self.status = next;
        self.updated_at = now;
        if next == CommissionStatus::Completed {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Records the processor payment id. Once set it is never replaced.
    pub fn record_payment(&mut self, payment_confirmation_id: &str) -> Result<(), SettlementError> {
        match &self.payment_confirmation_id {
            Some(existing) if existing == payment_confirmation_id => Err(
                SettlementError::DuplicateSettlementEvent(payment_confirmation_id.to_string()),
            ),
            Some(existing) => Err(SettlementError::ValidationError(format!(
                "commission {} already bound to payment {}",
                self.id, existing
            ))),
            None => {
                self.payment_confirmation_id = Some(payment_confirmation_id.to_string());
                Ok(())
            }
        }
    }

    /// Records a cancellation whose refund has already been issued.
    ///
    /// The refund cannot be taken back, so a record that moved along another
    /// edge in the meantime is cancelled anyway and flagged for review. A
    /// record that is already terminal keeps its state and is only flagged.
    pub fn cancel_after_refund(&mut self, event: CommissionEvent, reason: &str, now: DateTime<Utc>) {
        match self.status.apply(event) {
            Ok(next) => {
                self.status = next;
                self.cancellation_reason = Some(reason.to_string());
            }
            Err(_) if self.status.is_terminal() => {
                self.review_reason = Some(format!("refunded while already {}", self.status));
            }
            Err(_) => {
                self.review_reason = Some(format!("refunded while {}, cancelled anyway", self.status));
                self.status = CommissionStatus::Cancelled;
                self.cancellation_reason = Some(reason.to_string());
            }
        }
        self.updated_at = now;
    }

    /// Records the processor transfer id and completes the commission.
    pub fn settle(&mut self, transfer_id: &str, now: DateTime<Utc>) -> Result<(), SettlementError> {
        if self.transfer_id.is_some() {
            return Err(SettlementError::ValidationError(format!(
                "commission {} already has a transfer",
                self.id
            )));
        }
        self.advance(CommissionEvent::PayoutSettled, now)?;
        self.transfer_id = Some(transfer_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [CommissionStatus; 9] = [
        CommissionStatus::PendingArtist,
        CommissionStatus::RejectedByArtist,
        CommissionStatus::Requested,
        CommissionStatus::InProgress,
        CommissionStatus::Delivered,
        CommissionStatus::Approved,
        CommissionStatus::CronPending,
        CommissionStatus::Completed,
        CommissionStatus::Cancelled,
    ];

    const ALL_EVENTS: [CommissionEvent; 10] = [
        CommissionEvent::Accept,
        CommissionEvent::Reject,
        CommissionEvent::PaymentConfirmed,
        CommissionEvent::Deliver,
        CommissionEvent::Approve,
        CommissionEvent::RequestRevision,
        CommissionEvent::Cancel,
        CommissionEvent::Expire,
        CommissionEvent::QueuePayout,
        CommissionEvent::PayoutSettled,
    ];

    fn commission() -> Commission {
        Commission::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Money::new(dec!(10.00)),
            SubscriptionTier::Free,
            2,
            Utc::now(),
        )
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in ALL_STATES.iter().filter(|s| s.is_terminal()) {
            for event in ALL_EVENTS {
                assert!(
                    matches!(
                        state.apply(event),
                        Err(SettlementError::IllegalTransition { .. })
                    ),
                    "{state} should not accept {event}"
                );
            }
        }
    }

    #[test]
    fn test_legal_edge_count() {
        let legal: usize = ALL_STATES
            .iter()
            .map(|s| ALL_EVENTS.iter().filter(|e| s.apply(**e).is_ok()).count())
            .sum();
        assert_eq!(legal, 14);
    }

    #[test]
    fn test_happy_path() {
        let mut c = commission();
        let now = Utc::now();
        for event in [
            CommissionEvent::Accept,
            CommissionEvent::PaymentConfirmed,
            CommissionEvent::Deliver,
            CommissionEvent::Approve,
            CommissionEvent::QueuePayout,
        ] {
            c.advance(event, now).unwrap();
        }
        assert_eq!(c.status, CommissionStatus::CronPending);
        c.settle("tr_1", now).unwrap();
        assert_eq!(c.status, CommissionStatus::Completed);
        assert_eq!(c.transfer_id.as_deref(), Some("tr_1"));
        assert!(c.completed_at.is_some());
    }

    #[test]
    fn test_settle_requires_cron_pending() {
        let mut c = commission();
        c.status = CommissionStatus::Approved;
        assert!(c.settle("tr_1", Utc::now()).is_err());
        assert!(c.transfer_id.is_none());
    }

    #[test]
    fn test_illegal_advance_leaves_record_unchanged() {
        let mut c = commission();
        let before = c.clone();
        let err = c.advance(CommissionEvent::Deliver, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            SettlementError::IllegalTransition {
                from: CommissionStatus::PendingArtist,
                event: CommissionEvent::Deliver
            }
        ));
        assert_eq!(c, before);
    }

    #[test]
    fn test_record_payment_is_write_once() {
        let mut c = commission();
        c.record_payment("pi_1").unwrap();
        assert!(matches!(
            c.record_payment("pi_1"),
            Err(SettlementError::DuplicateSettlementEvent(_))
        ));
        assert!(c.record_payment("pi_2").is_err());
        assert_eq!(c.payment_confirmation_id.as_deref(), Some("pi_1"));
    }

    #[test]
    fn test_requester_price_with_margin() {
        let price = requester_price(Money::new(dec!(10.00)), dec!(0.15));
        assert_eq!(price, Money::new(dec!(11.50)));
        assert_eq!(commission().requester_price, Money::new(dec!(11.50)));
    }

    #[test]
    fn test_expiry_past_calendar_end_is_none() {
        let c = commission();
        assert_eq!(c.expires_at(Duration::weeks(1)), Some(c.created_at + Duration::weeks(1)));
        assert_eq!(c.expires_at(Duration::MAX), None);
    }

    #[test]
    fn test_cancel_after_refund_on_legal_edge() {
        let mut c = commission();
        c.status = CommissionStatus::Delivered;
        c.cancel_after_refund(CommissionEvent::Cancel, "changed my mind", Utc::now());
        assert_eq!(c.status, CommissionStatus::Cancelled);
        assert_eq!(c.cancellation_reason.as_deref(), Some("changed my mind"));
        assert!(c.review_reason.is_none());
    }

    #[test]
    fn test_cancel_after_refund_overrides_moved_state() {
        let mut c = commission();
        c.status = CommissionStatus::CronPending;
        c.cancel_after_refund(CommissionEvent::Cancel, "changed my mind", Utc::now());
        assert_eq!(c.status, CommissionStatus::Cancelled);
        assert!(c.review_reason.as_deref().unwrap().contains("cron_pending"));
    }

    #[test]
    fn test_cancel_after_refund_keeps_terminal_state() {
        let mut c = commission();
        c.status = CommissionStatus::Completed;
        c.cancel_after_refund(CommissionEvent::Expire, "expired", Utc::now());
        assert_eq!(c.status, CommissionStatus::Completed);
        assert!(c.cancellation_reason.is_none());
        assert!(c.review_reason.is_some());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&CommissionStatus::CronPending).unwrap();
        assert_eq!(json, "\"cron_pending\"");
    }
}
