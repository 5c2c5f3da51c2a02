use crate::application::SettlementContext;
use crate::domain::commission::{Commission, CommissionStatus, SubscriptionTier};
use crate::domain::events::{CheckoutCompleted, PaymentState};
use crate::domain::ledger::{EntrySource, LedgerEntry};
use crate::domain::money::Money;
use crate::domain::payee::PayeeProfile;
use crate::error::{Result, SettlementError};
use crate::infrastructure::sandbox_processor::SandboxProcessor;
use chrono::Duration;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use uuid::Uuid;

/// Starting state for a CLI run, read from JSON.
///
/// Ages are given in days relative to the clock at load time so fixtures
/// do not go stale.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub processor: SeedProcessor,
    pub payees: Vec<PayeeProfile>,
    pub commissions: Vec<SeedCommission>,
    pub ledger: Vec<SeedQueue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedProcessor {
    pub available: Decimal,
    pub payments: Vec<SeedPayment>,
    pub completed_checkouts: Vec<SeedCheckout>,
    pub failing_destinations: Vec<String>,
    pub failing_refunds: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedPayment {
    pub id: String,
    pub state: PaymentState,
    pub captured: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeedCheckout {
    pub session_id: String,
    pub payment_confirmation_id: Option<String>,
    #[serde(default)]
    pub metadata: crate::domain::events::Metadata,
    #[serde(default)]
    pub age_hours: i64,
}

#[derive(Debug, Deserialize)]
pub struct SeedCommission {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub fulfiller_id: Uuid,
    pub fulfiller_price: Decimal,
    pub status: CommissionStatus,
    #[serde(default)]
    pub tier: SubscriptionTier,
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    #[serde(default)]
    pub age_days: i64,
    pub checkout_session_id: Option<String>,
    pub payment_confirmation_id: Option<String>,
}

fn default_max_revisions() -> u32 {
    2
}

#[derive(Debug, Deserialize)]
pub struct SeedQueue {
    pub payee_id: Uuid,
    pub entries: Vec<SeedEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SeedEntry {
    pub amount: Decimal,
    pub source: EntrySource,
    #[serde(default)]
    pub reference: String,
    pub commission_id: Option<Uuid>,
    pub payment_confirmation_id: Option<String>,
    #[serde(default)]
    pub age_days: i64,
}

impl Seed {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Loads the seed into the stores and the sandbox processor.
    ///
    /// Commissions already present (e.g. a reopened database) are left as they are.
    pub async fn apply(self, ctx: &SettlementContext, processor: &SandboxProcessor) -> Result<()> {
        let now = ctx.clock.now();

        processor.set_available(Money::new(self.processor.available)).await;
        for payment in self.processor.payments {
            processor
                .add_payment(&payment.id, payment.state, payment.captured)
                .await;
        }
        for checkout in self.processor.completed_checkouts {
            processor
                .complete_checkout(CheckoutCompleted {
                    session_id: checkout.session_id,
                    payment_confirmation_id: checkout.payment_confirmation_id,
                    metadata: checkout.metadata,
                    completed_at: now - hours(checkout.age_hours)?,
                })
                .await;
        }
        for destination in &self.processor.failing_destinations {
            processor.fail_transfers_to(destination).await;
        }
        for payment_id in &self.processor.failing_refunds {
            processor.fail_refunds_for(payment_id).await;
        }

        for profile in self.payees {
            ctx.payees.upsert(profile).await?;
        }

        for seed in self.commissions {
            if ctx.commissions.get(seed.id).await?.is_some() {
                tracing::debug!(commission_id = %seed.id, "seed commission already stored, skipped");
                continue;
            }
            let created_at = now - days(seed.age_days)?;
            let mut commission = Commission::new(
                seed.requester_id,
                seed.fulfiller_id,
                Money::new(seed.fulfiller_price),
                seed.tier,
                seed.max_revisions,
                created_at,
            );
            commission.id = seed.id;
            commission.status = seed.status;
            commission.checkout_session_id = seed.checkout_session_id;
            commission.payment_confirmation_id = seed.payment_confirmation_id;
            ctx.commissions.insert(commission).await?;
        }

        for queue in self.ledger {
            let mut entries = Vec::with_capacity(queue.entries.len());
            for seed in queue.entries {
                let mut entry = LedgerEntry::new(
                    Money::new(seed.amount),
                    seed.source,
                    seed.reference,
                    now - days(seed.age_days)?,
                );
                if let Some(commission_id) = seed.commission_id {
                    entry = entry.for_commission(commission_id);
                }
                if let Some(payment_id) = seed.payment_confirmation_id {
                    entry = entry.with_payment(payment_id);
                }
                entries.push(entry);
            }
            ctx.ledger.import(queue.payee_id, entries).await?;
        }

        tracing::info!("seed applied");
        Ok(())
    }
}

fn days(n: i64) -> Result<Duration> {
    Duration::try_days(n).ok_or_else(|| SettlementError::ValidationError(format!("age of {n} days is out of range")))
}

fn hours(n: i64) -> Result<Duration> {
    Duration::try_hours(n).ok_or_else(|| SettlementError::ValidationError(format!("age of {n} hours is out of range")))
}
