use super::money::{Amount, Money};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

pub const SUBJECT_KEY: &str = "subject";
pub const COMMISSION_ID_KEY: &str = "commission_id";
pub const PAYEE_ID_KEY: &str = "payee_id";
pub const PAYEE_AMOUNT_KEY: &str = "payee_amount";
pub const REFERENCE_KEY: &str = "reference";

/// What a checkout paid for, as carried in the processor metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutSubject {
    Commission {
        commission_id: Uuid,
    },
    /// A direct purchase whose seller share is owed to `payee_id`.
    Purchase {
        payee_id: Uuid,
        payee_amount: Amount,
        reference: String,
    },
}

impl CheckoutSubject {
    pub fn to_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        match self {
            CheckoutSubject::Commission { commission_id } => {
                metadata.insert(SUBJECT_KEY.to_string(), "commission".to_string());
                metadata.insert(COMMISSION_ID_KEY.to_string(), commission_id.to_string());
            }
            CheckoutSubject::Purchase {
                payee_id,
                payee_amount,
                reference,
            } => {
                metadata.insert(SUBJECT_KEY.to_string(), "purchase".to_string());
                metadata.insert(PAYEE_ID_KEY.to_string(), payee_id.to_string());
                metadata.insert(PAYEE_AMOUNT_KEY.to_string(), payee_amount.to_string());
                metadata.insert(REFERENCE_KEY.to_string(), reference.clone());
            }
        }
        metadata
    }

    /// Reads the subject back; `None` for anything incomplete or malformed.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        match metadata.get(SUBJECT_KEY)?.as_str() {
            "commission" => Some(CheckoutSubject::Commission {
                commission_id: metadata.get(COMMISSION_ID_KEY)?.parse().ok()?,
            }),
            "purchase" => {
                let amount: Decimal = metadata.get(PAYEE_AMOUNT_KEY)?.parse().ok()?;
                Some(CheckoutSubject::Purchase {
                    payee_id: metadata.get(PAYEE_ID_KEY)?.parse().ok()?,
                    payee_amount: Amount::new(amount).ok()?,
                    reference: metadata
                        .get(REFERENCE_KEY)
                        .cloned()
                        .unwrap_or_else(|| "checkout purchase".to_string()),
                })
            }
            _ => None,
        }
    }
}

/// `checkout.completed` as delivered by webhook or found by the history sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutCompleted {
    pub session_id: String,
    pub payment_confirmation_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub completed_at: DateTime<Utc>,
}

impl CheckoutCompleted {
    pub fn subject(&self) -> Option<CheckoutSubject> {
        CheckoutSubject::from_metadata(&self.metadata)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    RequiresCapture,
    Processing,
    Succeeded,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatus {
    pub id: String,
    pub state: PaymentState,
    pub captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessorBalance {
    pub available: Money,
    pub pending: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub id: String,
    pub amount: Amount,
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub id: String,
    pub payment_confirmation_id: String,
}

/// Outbound attention-change events, fire-and-forget.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient: Uuid,
    pub commission_id: Uuid,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationKind {
    Accepted,
    Rejected,
    PaymentReceived,
    Delivered,
    Approved,
    RevisionRequested,
    Cancelled { reason: String },
    Expired { reason: String },
    PayoutSent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subject_metadata_round_trip() {
        let purchase = CheckoutSubject::Purchase {
            payee_id: Uuid::new_v4(),
            payee_amount: Amount::new(dec!(8.5)).unwrap(),
            reference: "brush pack".to_string(),
        };
        assert_eq!(
            CheckoutSubject::from_metadata(&purchase.to_metadata()),
            Some(purchase)
        );
    }

    #[test]
    fn test_malformed_subject_is_none() {
        let mut metadata = Metadata::new();
        assert!(CheckoutSubject::from_metadata(&metadata).is_none());

        metadata.insert(SUBJECT_KEY.to_string(), "commission".to_string());
        metadata.insert(COMMISSION_ID_KEY.to_string(), "not-a-uuid".to_string());
        assert!(CheckoutSubject::from_metadata(&metadata).is_none());

        metadata.insert(SUBJECT_KEY.to_string(), "purchase".to_string());
        metadata.insert(PAYEE_ID_KEY.to_string(), Uuid::new_v4().to_string());
        metadata.insert(PAYEE_AMOUNT_KEY.to_string(), "-4".to_string());
        assert!(CheckoutSubject::from_metadata(&metadata).is_none());
    }
}
