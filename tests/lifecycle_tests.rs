mod common;

use chrono::{Duration, Utc};
use common::Harness;
use commission_settlement::application::dispatcher::{
    CleanupPolicy, DispatchOutcome, PayoutDispatcher,
};
use commission_settlement::application::reconciler::{ReconcilerConfig, SettlementReconciler};
use commission_settlement::application::sweeper::ExpirySweeper;
use commission_settlement::domain::commission::{Actor, CommissionStatus};
use commission_settlement::domain::events::{CheckoutCompleted, Metadata, NotificationKind};
use commission_settlement::domain::ledger::{EntrySource, LedgerEntry};
use commission_settlement::domain::money::Money;
use commission_settlement::error::SettlementError;
use rust_decimal_macros::dec;

async fn pay(h: &Harness, session_id: &str, payment_id: &str) {
    let event = CheckoutCompleted {
        session_id: session_id.to_string(),
        payment_confirmation_id: Some(payment_id.to_string()),
        metadata: Metadata::new(),
        completed_at: Utc::now(),
    };
    h.processor.complete_checkout(event.clone()).await;
    SettlementReconciler::new(h.ctx.clone(), ReconcilerConfig::default())
        .handle_checkout_completed(event)
        .await;
}

#[tokio::test]
async fn test_commission_settles_end_to_end() {
    let h = Harness::new().await;
    h.processor.set_available(Money::new(dec!(500))).await;

    let (c, session_id) = h.awaiting_payment(dec!(40)).await;
    pay(&h, &session_id, "pi_e2e").await;
    h.controller
        .deliver(
            h.fulfiller(),
            c.id,
            "final.png".to_string(),
            Some("preview.png".to_string()),
        )
        .await
        .unwrap();
    let approved = h.controller.approve(h.requester(), c.id).await.unwrap();
    assert_eq!(approved.status, CommissionStatus::CronPending);

    let queued = h.ctx.ledger.entries(h.fulfiller).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].source, EntrySource::CommissionPayout);
    assert_eq!(queued[0].amount, Money::new(dec!(40)));
    assert_eq!(queued[0].payment_confirmation_id(), Some("pi_e2e"));

    let report = PayoutDispatcher::new(h.ctx.clone(), CleanupPolicy::default())
        .run()
        .await;
    assert_eq!(report.succeeded, 1);

    let done = h.controller.get(c.id).await.unwrap();
    assert_eq!(done.status, CommissionStatus::Completed);
    assert!(done.transfer_id.is_some());
    assert!(done.completed_at.is_some());
    assert!(h.ctx.ledger.entries(h.fulfiller).await.unwrap().is_empty());
    assert_eq!(h.processor.available().await, Money::new(dec!(460)));

    let kinds: Vec<NotificationKind> = h.notifier.sent().await.into_iter().map(|n| n.kind).collect();
    for expected in [
        NotificationKind::Accepted,
        NotificationKind::PaymentReceived,
        NotificationKind::Delivered,
        NotificationKind::Approved,
        NotificationKind::PayoutSent,
    ] {
        assert!(kinds.contains(&expected), "missing {expected:?}");
    }
}

#[tokio::test]
async fn test_second_payout_queue_is_rejected() {
    let h = Harness::new().await;
    let (c, session_id) = h.awaiting_payment(dec!(25)).await;
    pay(&h, &session_id, "pi_twice").await;
    h.controller
        .deliver(h.fulfiller(), c.id, "final.png".to_string(), None)
        .await
        .unwrap();
    h.controller.approve(h.requester(), c.id).await.unwrap();

    let err = h.controller.queue_payout(Actor::Admin, c.id).await.unwrap_err();
    assert!(matches!(
        err,
        SettlementError::IllegalTransition {
            from: CommissionStatus::CronPending,
            ..
        }
    ));
    assert_eq!(h.ctx.ledger.entries(h.fulfiller).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_interrupted_queue_is_repaired() {
    let h = Harness::new().await;
    let (c, session_id) = h.awaiting_payment(dec!(25)).await;
    pay(&h, &session_id, "pi_crash").await;
    h.controller
        .deliver(h.fulfiller(), c.id, "final.png".to_string(), None)
        .await
        .unwrap();

    // An earlier attempt got the entry in but never wrote the status.
    h.ctx
        .ledger
        .append(
            h.fulfiller,
            LedgerEntry::new(
                Money::new(dec!(25)),
                EntrySource::CommissionPayout,
                "payout",
                Utc::now(),
            )
            .for_commission(c.id),
        )
        .await
        .unwrap();

    let err = h.controller.queue_payout(Actor::Admin, c.id).await.unwrap_err();
    assert!(matches!(err, SettlementError::AlreadyQueued(id) if id == c.id));
    assert_eq!(h.ctx.ledger.entries(h.fulfiller).await.unwrap().len(), 1);
    assert_eq!(
        h.controller.get(c.id).await.unwrap().status,
        CommissionStatus::CronPending
    );
}

#[tokio::test]
async fn test_admin_queues_payout_from_delivered() {
    let h = Harness::new().await;
    let (c, session_id) = h.awaiting_payment(dec!(25)).await;
    pay(&h, &session_id, "pi_admin").await;
    h.controller
        .deliver(h.fulfiller(), c.id, "final.png".to_string(), None)
        .await
        .unwrap();

    let err = h
        .controller
        .queue_payout(h.requester(), c.id)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Forbidden(_)));

    let queued = h.controller.queue_payout(Actor::Admin, c.id).await.unwrap();
    assert_eq!(queued.status, CommissionStatus::CronPending);
}

#[tokio::test]
async fn test_requester_cancel_after_delivery_refunds() {
    let h = Harness::new().await;
    let (c, session_id) = h.awaiting_payment(dec!(30)).await;
    pay(&h, &session_id, "pi_cancel").await;
    h.controller
        .deliver(h.fulfiller(), c.id, "final.png".to_string(), None)
        .await
        .unwrap();

    let cancelled = h
        .controller
        .cancel(h.requester(), c.id, "not what I asked for".to_string())
        .await
        .unwrap();
    assert_eq!(cancelled.status, CommissionStatus::Cancelled);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some("not what I asked for")
    );
    assert_eq!(h.processor.refunds().await.len(), 1);
}

#[tokio::test]
async fn test_cancelled_commission_is_never_paid_out() {
    let h = Harness::new().await;
    h.processor.set_available(Money::new(dec!(100))).await;
    let (c, session_id) = h.awaiting_payment(dec!(30)).await;
    pay(&h, &session_id, "pi_race").await;
    h.controller
        .deliver(h.fulfiller(), c.id, "final.png".to_string(), None)
        .await
        .unwrap();
    h.controller.queue_payout(Actor::Admin, c.id).await.unwrap();

    // The record moves to cancelled behind the dispatcher's back.
    let mut stale = h.controller.get(c.id).await.unwrap();
    stale.status = CommissionStatus::Cancelled;
    h.ctx.commissions.compare_and_swap(stale).await.unwrap().unwrap();

    let report = PayoutDispatcher::new(h.ctx.clone(), CleanupPolicy::default())
        .run()
        .await;
    assert_eq!(report.held, 1);
    assert!(matches!(
        report.items[0].outcome,
        DispatchOutcome::HeldForReview { .. }
    ));
    assert!(h.processor.transfers().await.is_empty());
    assert_eq!(h.ctx.ledger.entries(h.fulfiller).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delivered_commission_is_not_swept() {
    let h = Harness::new().await;
    let (c, session_id) = h.awaiting_payment(dec!(30)).await;
    pay(&h, &session_id, "pi_late").await;
    h.controller
        .deliver(h.fulfiller(), c.id, "final.png".to_string(), None)
        .await
        .unwrap();
    h.clock.advance(Duration::days(30));

    let report = ExpirySweeper::new(h.ctx.clone()).run().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(
        h.controller.get(c.id).await.unwrap().status,
        CommissionStatus::Delivered
    );
}

#[tokio::test]
async fn test_same_day_unpaid_delete() {
    let h = Harness::new().await;
    let c = h.create(dec!(10), 1).await;

    let err = h
        .controller
        .delete_unpaid(h.fulfiller(), c.id)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Forbidden(_)));

    h.controller.delete_unpaid(h.requester(), c.id).await.unwrap();
    assert!(matches!(
        h.controller.get(c.id).await,
        Err(SettlementError::NotFound(_))
    ));
}
