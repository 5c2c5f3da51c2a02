use super::commission::SubscriptionTier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayoutAccountStatus {
    #[default]
    Pending,
    Active,
    Restricted,
    Rejected,
}

/// Payout fields owned by account management and read by settlement.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct SettlementProfile {
    pub external_payout_account_id: Option<String>,
    pub payouts_enabled: bool,
    pub onboarding_complete: bool,
    pub account_status: PayoutAccountStatus,
}

impl SettlementProfile {
    /// Transfers may only target active accounts with payouts switched on.
    pub fn is_payout_eligible(&self) -> bool {
        self.account_status == PayoutAccountStatus::Active
            && self.payouts_enabled
            && self.external_payout_account_id.is_some()
    }
}

/// A user who can be paid: fulfillers and sellers.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PayeeProfile {
    pub id: Uuid,
    #[serde(default)]
    pub settlement: SettlementProfile,
    /// Free-text delivery promise, e.g. "2 weeks".
    #[serde(default)]
    pub delivery_time: Option<String>,
    #[serde(default)]
    pub tier: SubscriptionTier,
}

impl PayeeProfile {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            settlement: SettlementProfile::default(),
            delivery_time: None,
            tier: SubscriptionTier::default(),
        }
    }

    /// Profile that passes the payout eligibility check.
    pub fn active(id: Uuid, payout_account: impl Into<String>) -> Self {
        Self {
            settlement: SettlementProfile {
                external_payout_account_id: Some(payout_account.into()),
                payouts_enabled: true,
                onboarding_complete: true,
                account_status: PayoutAccountStatus::Active,
            },
            ..Self::new(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility_requires_active_and_enabled() {
        let id = Uuid::new_v4();
        assert!(PayeeProfile::active(id, "acct_1").settlement.is_payout_eligible());

        let mut restricted = PayeeProfile::active(id, "acct_1");
        restricted.settlement.account_status = PayoutAccountStatus::Restricted;
        assert!(!restricted.settlement.is_payout_eligible());

        let mut disabled = PayeeProfile::active(id, "acct_1");
        disabled.settlement.payouts_enabled = false;
        assert!(!disabled.settlement.is_payout_eligible());

        assert!(!PayeeProfile::new(id).settlement.is_payout_eligible());
    }
}
