//! The ledger owns every balance mutation. Each change is an immutable
//! posting; the cached balance always equals the sum of the user's postings.

use crate::auth::Identity;
use crate::{CoreError, CoreResult};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use trueque_storage::{
    PostingDraft, PostingKind, PostingRecord, QueryWindow, ReferenceType, TruequeStorage, UserId,
};

/// Number of recent postings returned by a wallet summary.
const SUMMARY_WINDOW: usize = 20;

/// Current balance plus the most recent postings, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub balance: Decimal,
    pub recent: Vec<PostingRecord>,
}

/// Cached balance against the recomputed posting sum, for operators
/// verifying ledger consistency on demand.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    pub user_id: UserId,
    pub cached_balance: Decimal,
    pub derived_balance: Decimal,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct Ledger {
    storage: Arc<dyn TruequeStorage>,
}

impl Ledger {
    pub fn new(storage: Arc<dyn TruequeStorage>) -> Self {
        Self { storage }
    }

    /// Append one posting and update the cached balance atomically. A debit
    /// that would overdraw the balance fails with `InsufficientFunds` and
    /// leaves nothing behind.
    pub async fn post(
        &self,
        user: UserId,
        amount: Decimal,
        kind: PostingKind,
        reference_type: ReferenceType,
        reference_id: Option<i64>,
    ) -> CoreResult<PostingRecord> {
        let mut draft = PostingDraft::new(user, amount, kind, reference_type);
        if let Some(reference) = reference_id {
            draft = draft.with_reference(reference);
        }
        let records = self.storage.append_postings(vec![draft]).await?;
        let posting = records
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Internal("posting append returned no record".to_string()))?;
        tracing::info!(user = %user, amount = %amount, posting = %posting.id, "ledger posting");
        Ok(posting)
    }

    pub async fn balance(&self, user: UserId) -> CoreResult<Decimal> {
        Ok(self.storage.balance(user).await?)
    }

    /// Privileged posting that bypasses the sufficiency check. The override
    /// is still a regular posting, with the reason on the record.
    pub async fn admin_adjust(
        &self,
        caller: &Identity,
        user: UserId,
        amount: Decimal,
        reason: &str,
    ) -> CoreResult<PostingRecord> {
        caller.require_admin()?;
        if reason.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "an adjustment reason is required".to_string(),
            ));
        }
        let draft = PostingDraft::new(
            user,
            amount,
            PostingKind::AdminAdjustment,
            ReferenceType::Admin,
        )
        .with_note(reason);
        let records = self.storage.append_postings(vec![draft]).await?;
        let posting = records
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Internal("posting append returned no record".to_string()))?;
        tracing::info!(
            admin = %caller.user_id,
            user = %user,
            amount = %amount,
            "admin balance adjustment"
        );
        Ok(posting)
    }

    pub async fn wallet_summary(&self, user: UserId) -> CoreResult<WalletSummary> {
        let balance = self.storage.balance(user).await?;
        let recent = self
            .storage
            .list_postings(user, QueryWindow::limited(SUMMARY_WINDOW))
            .await?;
        Ok(WalletSummary { balance, recent })
    }

    pub async fn audit_user(&self, caller: &Identity, user: UserId) -> CoreResult<LedgerAudit> {
        caller.require_admin()?;
        let cached = self.storage.balance(user).await?;
        let derived = self.storage.sum_postings(user).await?;
        Ok(LedgerAudit {
            user_id: user,
            cached_balance: cached,
            derived_balance: derived,
            consistent: cached == derived,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use trueque_storage::{InMemoryStorage, NewUser, Role, UserStore};

    fn admin() -> Identity {
        Identity::new(UserId(999), Role::Admin)
    }

    async fn setup() -> (Ledger, UserId) {
        let storage = Arc::new(InMemoryStorage::new());
        let user = storage
            .create_user(NewUser {
                email: "a@example.com".to_string(),
                display_name: "a".to_string(),
                role: Role::User,
                company_id: None,
            })
            .await
            .unwrap();
        (Ledger::new(storage), user.id)
    }

    #[tokio::test]
    async fn balance_always_equals_posting_sum() {
        let (ledger, user) = setup().await;
        ledger
            .admin_adjust(&admin(), user, dec!(100), "grant")
            .await
            .unwrap();
        ledger
            .post(
                user,
                dec!(-30),
                PostingKind::RewardSpend,
                ReferenceType::Reward,
                Some(1),
            )
            .await
            .unwrap();

        let audit = ledger.audit_user(&admin(), user).await.unwrap();
        assert_eq!(audit.cached_balance, dec!(70));
        assert!(audit.consistent);
    }

    #[tokio::test]
    async fn concurrent_debits_cannot_overdraw() {
        let (ledger, user) = setup().await;
        ledger
            .admin_adjust(&admin(), user, dec!(50), "grant")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .post(
                        user,
                        dec!(-50),
                        PostingKind::RewardSpend,
                        ReferenceType::Reward,
                        None,
                    )
                    .await
            }));
        }
        let mut successes = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(CoreError::InsufficientFunds(_)) => insufficient += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(insufficient, 3);
        assert_eq!(ledger.balance(user).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn adjustment_requires_admin_and_reason() {
        let (ledger, user) = setup().await;
        let caller = Identity::new(user, Role::User);
        let denied = ledger.admin_adjust(&caller, user, dec!(10), "grant").await;
        assert!(matches!(denied, Err(CoreError::Forbidden(_))));

        let missing_reason = ledger.admin_adjust(&admin(), user, dec!(10), "  ").await;
        assert!(matches!(missing_reason, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn wallet_summary_returns_newest_postings_first() {
        let (ledger, user) = setup().await;
        for i in 1..=25 {
            ledger
                .admin_adjust(&admin(), user, Decimal::from(i), "grant")
                .await
                .unwrap();
        }
        let summary = ledger.wallet_summary(user).await.unwrap();
        assert_eq!(summary.recent.len(), 20);
        assert_eq!(summary.recent[0].amount, dec!(25));
        assert_eq!(summary.balance, Decimal::from(25 * 26 / 2));
    }
}
