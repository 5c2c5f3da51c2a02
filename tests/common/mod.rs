#![allow(dead_code)]

use chrono::Utc;
use commission_settlement::application::SettlementContext;
use commission_settlement::application::controller::{CommissionController, NewCommission};
use commission_settlement::domain::commission::{Actor, Commission};
use commission_settlement::domain::money::Amount;
use commission_settlement::domain::payee::PayeeProfile;
use commission_settlement::infrastructure::clock::FixedClock;
use commission_settlement::infrastructure::in_memory::{
    InMemoryCommissionStore, InMemoryLedgerStore, InMemoryPayeeDirectory, InMemoryWatermarkStore,
};
use commission_settlement::infrastructure::notifier::RecordingNotifier;
use commission_settlement::infrastructure::sandbox_processor::SandboxProcessor;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub struct Harness {
    pub ctx: SettlementContext,
    pub processor: SandboxProcessor,
    pub clock: FixedClock,
    pub notifier: RecordingNotifier,
    pub controller: CommissionController,
    pub requester: Uuid,
    pub fulfiller: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        let processor = SandboxProcessor::new();
        let clock = FixedClock::new(Utc::now());
        let notifier = RecordingNotifier::new();
        let ctx = SettlementContext {
            commissions: Arc::new(InMemoryCommissionStore::new()),
            ledger: Arc::new(InMemoryLedgerStore::new()),
            payees: Arc::new(InMemoryPayeeDirectory::new()),
            watermarks: Arc::new(InMemoryWatermarkStore::new()),
            processor: Arc::new(processor.clone()),
            notifier: Arc::new(notifier.clone()),
            clock: Arc::new(clock.clone()),
        };

        let fulfiller = Uuid::new_v4();
        let mut profile = PayeeProfile::active(fulfiller, "acct_fulfiller");
        profile.delivery_time = Some("1 week".to_string());
        ctx.payees.upsert(profile).await.unwrap();

        Self {
            controller: CommissionController::new(ctx.clone()),
            ctx,
            processor,
            clock,
            notifier,
            requester: Uuid::new_v4(),
            fulfiller,
        }
    }

    pub fn requester(&self) -> Actor {
        Actor::User(self.requester)
    }

    pub fn fulfiller(&self) -> Actor {
        Actor::User(self.fulfiller)
    }

    pub async fn create(&self, price: Decimal, max_revisions: u32) -> Commission {
        self.controller
            .create_commission(NewCommission {
                requester_id: self.requester,
                fulfiller_id: self.fulfiller,
                fulfiller_price: Amount::new(price).unwrap(),
                max_revisions,
                guide_asset: None,
            })
            .await
            .unwrap()
    }

    /// Creates, accepts and opens checkout. Returns the commission and session id.
    pub async fn awaiting_payment(&self, price: Decimal) -> (Commission, String) {
        let c = self.create(price, 2).await;
        self.controller.accept(self.fulfiller(), c.id).await.unwrap();
        let session = self
            .controller
            .begin_checkout(self.requester(), c.id)
            .await
            .unwrap();
        (c, session.id)
    }
}
