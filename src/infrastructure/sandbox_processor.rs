use crate::domain::events::{
    CheckoutCompleted, CheckoutSession, Metadata, PaymentState, PaymentStatus, ProcessorBalance,
    RefundReceipt, TransferReceipt,
};
use crate::domain::money::{Amount, Money};
use crate::domain::ports::PaymentProcessor;
use crate::error::ProcessorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct SandboxState {
    available: Money,
    pending: Money,
    checkouts: Vec<(CheckoutSession, Amount, Metadata)>,
    payments: HashMap<String, PaymentStatus>,
    completed: Vec<CheckoutCompleted>,
    refunds: Vec<RefundReceipt>,
    transfers: Vec<(TransferReceipt, Metadata)>,
    failing_destinations: HashSet<String>,
    failing_refunds: HashSet<String>,
    balance_unavailable: bool,
}

/// In-process stand-in for the payment processor.
///
/// Tracks balance, payments and transfers so that settlement runs can be
/// exercised end to end without network access. Failure switches let tests
/// inject processor errors per destination or payment.
#[derive(Default, Clone)]
pub struct SandboxProcessor {
    state: Arc<Mutex<SandboxState>>,
}

impl SandboxProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(available: Money) -> Self {
        Self {
            state: Arc::new(Mutex::new(SandboxState {
                available,
                ..Default::default()
            })),
        }
    }

    pub async fn set_available(&self, available: Money) {
        self.state.lock().await.available = available;
    }

    pub async fn available(&self) -> Money {
        self.state.lock().await.available
    }

    /// Registers a payment the processor knows about.
    pub async fn add_payment(&self, id: &str, state: PaymentState, captured: bool) {
        self.state.lock().await.payments.insert(
            id.to_string(),
            PaymentStatus {
                id: id.to_string(),
                state,
                captured,
            },
        );
    }

    /// Records a completed checkout visible to the history sweep.
    pub async fn complete_checkout(&self, event: CheckoutCompleted) {
        let mut state = self.state.lock().await;
        if let Some(payment_id) = &event.payment_confirmation_id {
            state
                .payments
                .entry(payment_id.clone())
                .or_insert_with(|| PaymentStatus {
                    id: payment_id.clone(),
                    state: PaymentState::Succeeded,
                    captured: true,
                });
        }
        state.completed.push(event);
    }

    pub async fn fail_transfers_to(&self, destination: &str) {
        self.state
            .lock()
            .await
            .failing_destinations
            .insert(destination.to_string());
    }

    pub async fn fail_refunds_for(&self, payment_confirmation_id: &str) {
        self.state
            .lock()
            .await
            .failing_refunds
            .insert(payment_confirmation_id.to_string());
    }

    pub async fn set_balance_unavailable(&self, unavailable: bool) {
        self.state.lock().await.balance_unavailable = unavailable;
    }

    pub async fn transfers(&self) -> Vec<TransferReceipt> {
        let state = self.state.lock().await;
        state.transfers.iter().map(|(t, _)| t.clone()).collect()
    }

    pub async fn refunds(&self) -> Vec<RefundReceipt> {
        self.state.lock().await.refunds.clone()
    }

    pub async fn checkouts(&self) -> Vec<CheckoutSession> {
        let state = self.state.lock().await;
        state.checkouts.iter().map(|(s, _, _)| s.clone()).collect()
    }
}

#[async_trait]
impl PaymentProcessor for SandboxProcessor {
    async fn create_checkout(
        &self,
        amount: Amount,
        metadata: Metadata,
    ) -> Result<CheckoutSession, ProcessorError> {
        let id = format!("cs_sandbox_{}", Uuid::new_v4().simple());
        let session = CheckoutSession {
            url: Some(format!("https://checkout.sandbox.invalid/{id}")),
            id,
        };
        let mut state = self.state.lock().await;
        state.checkouts.push((session.clone(), amount, metadata));
        Ok(session)
    }

    async fn retrieve_payment(
        &self,
        payment_confirmation_id: &str,
    ) -> Result<PaymentStatus, ProcessorError> {
        let state = self.state.lock().await;
        state
            .payments
            .get(payment_confirmation_id)
            .cloned()
            .ok_or_else(|| ProcessorError::NotFound(payment_confirmation_id.to_string()))
    }

    async fn create_refund(
        &self,
        payment_confirmation_id: &str,
        _metadata: Metadata,
    ) -> Result<RefundReceipt, ProcessorError> {
        let mut state = self.state.lock().await;
        if state.failing_refunds.contains(payment_confirmation_id) {
            return Err(ProcessorError::Unavailable(format!(
                "refund for {payment_confirmation_id} failed"
            )));
        }
        let payment = state
            .payments
            .get(payment_confirmation_id)
            .ok_or_else(|| ProcessorError::NotFound(payment_confirmation_id.to_string()))?;
        if !payment.captured {
            return Err(ProcessorError::Declined(
                "payment was never captured".to_string(),
            ));
        }
        let receipt = RefundReceipt {
            id: format!("re_sandbox_{}", Uuid::new_v4().simple()),
            payment_confirmation_id: payment_confirmation_id.to_string(),
        };
        state.refunds.push(receipt.clone());
        Ok(receipt)
    }

    async fn retrieve_balance(&self) -> Result<ProcessorBalance, ProcessorError> {
        let state = self.state.lock().await;
        if state.balance_unavailable {
            return Err(ProcessorError::Timeout);
        }
        Ok(ProcessorBalance {
            available: state.available,
            pending: state.pending,
        })
    }

    async fn create_transfer(
        &self,
        amount: Amount,
        destination: &str,
        metadata: Metadata,
    ) -> Result<TransferReceipt, ProcessorError> {
        let mut state = self.state.lock().await;
        if state.failing_destinations.contains(destination) {
            return Err(ProcessorError::Declined(format!(
                "destination {destination} cannot receive transfers"
            )));
        }
        if state.available < Money::from(amount) {
            return Err(ProcessorError::Declined("insufficient funds".to_string()));
        }
        state.available -= Money::from(amount);
        let receipt = TransferReceipt {
            id: format!("tr_sandbox_{}", Uuid::new_v4().simple()),
            amount,
            destination: destination.to_string(),
        };
        state.transfers.push((receipt.clone(), metadata));
        Ok(receipt)
    }

    async fn list_completed_checkouts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CheckoutCompleted>, ProcessorError> {
        let state = self.state.lock().await;
        Ok(state
            .completed
            .iter()
            .filter(|e| e.completed_at >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_transfer_draws_down_balance() {
        let processor = SandboxProcessor::with_balance(Money::new(dec!(30)));
        let amount = Amount::new(dec!(20)).unwrap();

        processor
            .create_transfer(amount, "acct_1", Metadata::new())
            .await
            .unwrap();
        assert_eq!(processor.available().await, Money::new(dec!(10)));

        let err = processor
            .create_transfer(amount, "acct_1", Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Declined(_)));
        assert_eq!(processor.transfers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_refund_requires_capture() {
        let processor = SandboxProcessor::new();
        processor
            .add_payment("pi_auth", PaymentState::RequiresCapture, false)
            .await;
        processor.add_payment("pi_cap", PaymentState::Succeeded, true).await;

        assert!(processor.create_refund("pi_auth", Metadata::new()).await.is_err());
        assert!(processor.create_refund("pi_cap", Metadata::new()).await.is_ok());
        assert!(matches!(
            processor.create_refund("pi_missing", Metadata::new()).await,
            Err(ProcessorError::NotFound(_))
        ));
    }
}
