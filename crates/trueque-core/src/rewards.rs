//! Reward catalog and redemption management.
//!
//! Redeeming debits the ledger and vends the voucher in one atomic unit:
//! never a debit without a voucher, never a voucher without a debit.

use crate::auth::Identity;
use crate::{CoreError, CoreResult};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use trueque_storage::{
    CompanyId, NewRedemption, NewReward, PostingDraft, PostingKind, QueryWindow, RedemptionId,
    RedemptionRecord, RedemptionStatus, ReferenceType, RewardId, RewardRecord, Role, StorageError,
    TruequeStorage,
};
use uuid::Uuid;

/// Bounded retry budget for voucher code collisions.
const CODE_ATTEMPTS: usize = 5;

/// Voucher code generation, pluggable for tests.
pub trait VoucherCodes: Send + Sync {
    fn generate(&self) -> String;
}

/// Production codes: the first 10 characters of a simple-format UUID,
/// uppercased.
pub struct UuidVoucherCodes;

impl VoucherCodes for UuidVoucherCodes {
    fn generate(&self) -> String {
        let raw = Uuid::new_v4().simple().to_string();
        raw[..10].to_uppercase()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cost_true_coins: Decimal,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Admins must name the owning company; company operators are scoped to
    /// their own.
    #[serde(default)]
    pub company_id: Option<CompanyId>,
}

#[derive(Clone)]
pub struct RedemptionManager {
    storage: Arc<dyn TruequeStorage>,
    codes: Arc<dyn VoucherCodes>,
}

impl RedemptionManager {
    pub fn new(storage: Arc<dyn TruequeStorage>) -> Self {
        Self::with_codes(storage, Arc::new(UuidVoucherCodes))
    }

    pub fn with_codes(storage: Arc<dyn TruequeStorage>, codes: Arc<dyn VoucherCodes>) -> Self {
        Self { storage, codes }
    }

    /// Company the caller operates, always resolved through the stored user
    /// record rather than anything caller-supplied.
    async fn company_of(&self, caller: &Identity) -> CoreResult<CompanyId> {
        let user = self
            .storage
            .get_user(caller.user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {} not found", caller.user_id)))?;
        user.company_id.ok_or_else(|| {
            CoreError::Forbidden(format!(
                "user {} is not a company operator",
                caller.user_id
            ))
        })
    }

    async fn scope_company(
        &self,
        caller: &Identity,
        requested: Option<CompanyId>,
    ) -> CoreResult<CompanyId> {
        match caller.role {
            Role::Admin => requested.ok_or_else(|| {
                CoreError::InvalidInput("company_id is required for admin calls".to_string())
            }),
            Role::Company => self.company_of(caller).await,
            Role::User => Err(CoreError::Forbidden(
                "company or admin role required".to_string(),
            )),
        }
    }

    pub async fn create_reward(
        &self,
        caller: &Identity,
        request: RewardRequest,
    ) -> CoreResult<RewardRecord> {
        caller.require_company_or_admin()?;
        if request.title.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "reward title must not be empty".to_string(),
            ));
        }
        if request.cost_true_coins <= Decimal::ZERO {
            return Err(CoreError::InvalidInput(
                "reward cost must be positive".to_string(),
            ));
        }
        let company_id = self.scope_company(caller, request.company_id).await?;
        let reward = self
            .storage
            .create_reward(NewReward {
                company_id,
                title: request.title,
                description: request.description,
                cost_true_coins: request.cost_true_coins,
                image_url: request.image_url,
            })
            .await?;
        tracing::info!(reward = %reward.id, company = %company_id, "reward created");
        Ok(reward)
    }

    pub async fn set_reward_active(
        &self,
        caller: &Identity,
        id: RewardId,
        active: bool,
    ) -> CoreResult<RewardRecord> {
        caller.require_company_or_admin()?;
        let reward = self
            .storage
            .get_reward(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("reward {id} not found")))?;
        if !caller.is_admin() && self.company_of(caller).await? != reward.company_id {
            return Err(CoreError::Forbidden(format!(
                "reward {id} belongs to another company"
            )));
        }
        Ok(self.storage.set_reward_active(id, active).await?)
    }

    /// Active rewards only; the public catalog never shows deactivated
    /// entries.
    pub async fn catalog(&self, window: QueryWindow) -> CoreResult<Vec<RewardRecord>> {
        Ok(self.storage.list_active_rewards(window).await?)
    }

    /// The caller's company view, including inactive rewards.
    pub async fn company_rewards(
        &self,
        caller: &Identity,
        window: QueryWindow,
    ) -> CoreResult<Vec<RewardRecord>> {
        let company = self.company_of(caller).await?;
        Ok(self.storage.rewards_by_company(company, window).await?)
    }

    /// Debit the reward cost and vend a `Pending` voucher atomically. Code
    /// collisions are retried with a fresh code up to the attempt budget.
    pub async fn redeem(
        &self,
        caller: &Identity,
        reward_id: RewardId,
    ) -> CoreResult<RedemptionRecord> {
        let reward = self
            .storage
            .get_reward(reward_id)
            .await?
            .filter(|r| r.is_active)
            .ok_or_else(|| CoreError::NotFound(format!("reward {reward_id} not found")))?;

        for attempt in 1..=CODE_ATTEMPTS {
            let code = self.codes.generate();
            let debit = PostingDraft::new(
                caller.user_id,
                -reward.cost_true_coins,
                PostingKind::RewardSpend,
                ReferenceType::Reward,
            )
            .with_reference(reward.id.0);
            match self
                .storage
                .create_redemption(
                    NewRedemption {
                        reward_id: reward.id,
                        user_id: caller.user_id,
                        code,
                    },
                    debit,
                )
                .await
            {
                Ok(redemption) => {
                    tracing::info!(
                        redemption = %redemption.id,
                        reward = %reward.id,
                        user = %caller.user_id,
                        cost = %reward.cost_true_coins,
                        "reward redeemed"
                    );
                    return Ok(redemption);
                }
                Err(StorageError::Conflict(_)) => {
                    tracing::debug!(reward = %reward.id, attempt, "voucher code collision");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(CoreError::Conflict(
            "could not generate a unique voucher code".to_string(),
        ))
    }

    /// `Pending -> Redeemed` or `Pending -> Cancelled`, by the owning
    /// company or an admin. Cancelling never refunds the ledger; a refund is
    /// an explicit admin adjustment.
    pub async fn update_status(
        &self,
        caller: &Identity,
        id: RedemptionId,
        to: RedemptionStatus,
    ) -> CoreResult<RedemptionRecord> {
        caller.require_company_or_admin()?;
        let redemption = self
            .storage
            .get_redemption(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("redemption {id} not found")))?;
        if !caller.is_admin() {
            let reward = self
                .storage
                .get_reward(redemption.reward_id)
                .await?
                .ok_or_else(|| {
                    CoreError::NotFound(format!("reward {} not found", redemption.reward_id))
                })?;
            if self.company_of(caller).await? != reward.company_id {
                return Err(CoreError::Forbidden(format!(
                    "redemption {id} belongs to another company"
                )));
            }
        }
        if to == RedemptionStatus::Pending {
            return Err(CoreError::InvalidTransition(
                "a redemption cannot return to pending".to_string(),
            ));
        }
        let updated = self
            .storage
            .transition_redemption(id, RedemptionStatus::Pending, to)
            .await?;
        tracing::info!(redemption = %id, status = ?updated.status, "redemption transitioned");
        Ok(updated)
    }

    pub async fn my_redemptions(
        &self,
        caller: &Identity,
        window: QueryWindow,
    ) -> CoreResult<Vec<RedemptionRecord>> {
        Ok(self
            .storage
            .redemptions_by_user(caller.user_id, window)
            .await?)
    }

    pub async fn company_redemptions(
        &self,
        caller: &Identity,
        window: QueryWindow,
    ) -> CoreResult<Vec<RedemptionRecord>> {
        let company = self.company_of(caller).await?;
        Ok(self.storage.redemptions_by_company(company, window).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trueque_storage::{CompanyStore, InMemoryStorage, NewCompany, NewUser, UserId, UserStore};

    struct Fixture {
        manager: RedemptionManager,
        ledger: Ledger,
        shopper: Identity,
        operator: Identity,
        company: CompanyId,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let company = storage
            .create_company(NewCompany {
                name: "cafe".to_string(),
                description: None,
                phone: None,
                address: None,
            })
            .await
            .unwrap();
        let shopper = storage
            .create_user(NewUser {
                email: "shopper@example.com".to_string(),
                display_name: "shopper".to_string(),
                role: Role::User,
                company_id: None,
            })
            .await
            .unwrap();
        let operator = storage
            .create_user(NewUser {
                email: "operator@example.com".to_string(),
                display_name: "operator".to_string(),
                role: Role::Company,
                company_id: Some(company.id),
            })
            .await
            .unwrap();
        Fixture {
            manager: RedemptionManager::new(Arc::clone(&storage) as Arc<dyn TruequeStorage>),
            ledger: Ledger::new(storage),
            shopper: Identity::new(shopper.id, Role::User),
            operator: Identity::new(operator.id, Role::Company),
            company: company.id,
        }
    }

    fn admin() -> Identity {
        Identity::new(UserId(999), Role::Admin)
    }

    async fn seed_reward(f: &Fixture, cost: Decimal) -> RewardRecord {
        f.manager
            .create_reward(
                &f.operator,
                RewardRequest {
                    title: "free coffee".to_string(),
                    description: None,
                    cost_true_coins: cost,
                    image_url: None,
                    company_id: None,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn redeem_debits_once_and_vends_a_code() {
        let f = fixture().await;
        let reward = seed_reward(&f, dec!(60)).await;
        f.ledger
            .admin_adjust(&admin(), f.shopper.user_id, dec!(100), "grant")
            .await
            .unwrap();

        let redemption = f.manager.redeem(&f.shopper, reward.id).await.unwrap();
        assert_eq!(redemption.status, RedemptionStatus::Pending);
        assert_eq!(redemption.code.len(), 10);
        assert_eq!(redemption.code, redemption.code.to_uppercase());
        assert_eq!(
            f.ledger.balance(f.shopper.user_id).await.unwrap(),
            dec!(40)
        );
    }

    #[tokio::test]
    async fn redeem_rejects_missing_inactive_and_unaffordable() {
        let f = fixture().await;
        let reward = seed_reward(&f, dec!(60)).await;

        let broke = f.manager.redeem(&f.shopper, reward.id).await;
        assert!(matches!(broke, Err(CoreError::InsufficientFunds(_))));

        f.manager
            .set_reward_active(&f.operator, reward.id, false)
            .await
            .unwrap();
        let inactive = f.manager.redeem(&f.shopper, reward.id).await;
        assert!(matches!(inactive, Err(CoreError::NotFound(_))));

        let missing = f.manager.redeem(&f.shopper, RewardId(404)).await;
        assert!(matches!(missing, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn code_collisions_are_retried_then_surface_as_conflict() {
        struct FixedCodes(AtomicUsize);
        impl VoucherCodes for FixedCodes {
            fn generate(&self) -> String {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                // First two calls collide, the third is fresh.
                if n < 2 {
                    "SAMECODE00".to_string()
                } else {
                    format!("FRESH{n:05}")
                }
            }
        }

        let f = fixture().await;
        let reward = seed_reward(&f, dec!(10)).await;
        f.ledger
            .admin_adjust(&admin(), f.shopper.user_id, dec!(100), "grant")
            .await
            .unwrap();

        let storage = f.ledger_storage();
        let manager =
            RedemptionManager::with_codes(storage, Arc::new(FixedCodes(AtomicUsize::new(0))));

        let first = manager.redeem(&f.shopper, reward.id).await.unwrap();
        assert_eq!(first.code, "SAMECODE00");
        let second = manager.redeem(&f.shopper, reward.id).await.unwrap();
        assert_eq!(second.code, "FRESH00002");
        assert_eq!(
            f.ledger.balance(f.shopper.user_id).await.unwrap(),
            dec!(80)
        );

        struct AlwaysSame;
        impl VoucherCodes for AlwaysSame {
            fn generate(&self) -> String {
                "SAMECODE00".to_string()
            }
        }
        let exhausted = RedemptionManager::with_codes(f.ledger_storage(), Arc::new(AlwaysSame))
            .redeem(&f.shopper, reward.id)
            .await;
        assert!(matches!(exhausted, Err(CoreError::Conflict(_))));
        // The exhausted attempts never debited.
        assert_eq!(
            f.ledger.balance(f.shopper.user_id).await.unwrap(),
            dec!(80)
        );
    }

    #[tokio::test]
    async fn redemption_status_is_company_gated_and_never_refunds() {
        let f = fixture().await;
        let reward = seed_reward(&f, dec!(30)).await;
        f.ledger
            .admin_adjust(&admin(), f.shopper.user_id, dec!(50), "grant")
            .await
            .unwrap();
        let redemption = f.manager.redeem(&f.shopper, reward.id).await.unwrap();

        let by_shopper = f
            .manager
            .update_status(&f.shopper, redemption.id, RedemptionStatus::Redeemed)
            .await;
        assert!(matches!(by_shopper, Err(CoreError::Forbidden(_))));

        let cancelled = f
            .manager
            .update_status(&f.operator, redemption.id, RedemptionStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, RedemptionStatus::Cancelled);
        // Cancellation does not refund.
        assert_eq!(
            f.ledger.balance(f.shopper.user_id).await.unwrap(),
            dec!(20)
        );

        let reopened = f
            .manager
            .update_status(&f.operator, redemption.id, RedemptionStatus::Redeemed)
            .await;
        assert!(matches!(reopened, Err(CoreError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn redeemed_sets_the_timestamp() {
        let f = fixture().await;
        let reward = seed_reward(&f, dec!(10)).await;
        f.ledger
            .admin_adjust(&admin(), f.shopper.user_id, dec!(10), "grant")
            .await
            .unwrap();
        let redemption = f.manager.redeem(&f.shopper, reward.id).await.unwrap();
        assert!(redemption.redeemed_at.is_none());

        let redeemed = f
            .manager
            .update_status(&admin(), redemption.id, RedemptionStatus::Redeemed)
            .await
            .unwrap();
        assert!(redeemed.redeemed_at.is_some());
    }

    #[tokio::test]
    async fn reward_creation_enforces_cost_and_scope() {
        let f = fixture().await;

        let free = f
            .manager
            .create_reward(
                &f.operator,
                RewardRequest {
                    title: "freebie".to_string(),
                    description: None,
                    cost_true_coins: Decimal::ZERO,
                    image_url: None,
                    company_id: None,
                },
            )
            .await;
        assert!(matches!(free, Err(CoreError::InvalidInput(_))));

        let by_user = f
            .manager
            .create_reward(
                &f.shopper,
                RewardRequest {
                    title: "nope".to_string(),
                    description: None,
                    cost_true_coins: dec!(5),
                    image_url: None,
                    company_id: Some(f.company),
                },
            )
            .await;
        assert!(matches!(by_user, Err(CoreError::Forbidden(_))));

        // Admins must say which company owns the reward.
        let unscoped = f
            .manager
            .create_reward(
                &admin(),
                RewardRequest {
                    title: "mystery".to_string(),
                    description: None,
                    cost_true_coins: dec!(5),
                    image_url: None,
                    company_id: None,
                },
            )
            .await;
        assert!(matches!(unscoped, Err(CoreError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn redemption_lists_are_scoped_and_newest_first() {
        let f = fixture().await;
        let storage = f.ledger_storage();
        let other_company = storage
            .create_company(NewCompany {
                name: "bakery".to_string(),
                description: None,
                phone: None,
                address: None,
            })
            .await
            .unwrap();
        let other_operator = storage
            .create_user(NewUser {
                email: "baker@example.com".to_string(),
                display_name: "baker".to_string(),
                role: Role::Company,
                company_id: Some(other_company.id),
            })
            .await
            .unwrap();
        let other_operator = Identity::new(other_operator.id, Role::Company);
        let other_shopper = storage
            .create_user(NewUser {
                email: "other@example.com".to_string(),
                display_name: "other".to_string(),
                role: Role::User,
                company_id: None,
            })
            .await
            .unwrap();
        let other_shopper = Identity::new(other_shopper.id, Role::User);

        let coffee = seed_reward(&f, dec!(10)).await;
        let bread = f
            .manager
            .create_reward(
                &other_operator,
                RewardRequest {
                    title: "fresh bread".to_string(),
                    description: None,
                    cost_true_coins: dec!(10),
                    image_url: None,
                    company_id: None,
                },
            )
            .await
            .unwrap();

        for user in [f.shopper.user_id, other_shopper.user_id] {
            f.ledger
                .admin_adjust(&admin(), user, dec!(100), "grant")
                .await
                .unwrap();
        }
        let first = f.manager.redeem(&f.shopper, coffee.id).await.unwrap();
        let second = f.manager.redeem(&f.shopper, bread.id).await.unwrap();
        let theirs = f.manager.redeem(&other_shopper, coffee.id).await.unwrap();

        let mine = f
            .manager
            .my_redemptions(&f.shopper, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(
            mine.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        let cafe = f
            .manager
            .company_redemptions(&f.operator, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(
            cafe.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![theirs.id, first.id]
        );

        let bakery = f
            .manager
            .company_redemptions(&other_operator, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(
            bakery.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![second.id]
        );

        // Plain users have no company view.
        let denied = f
            .manager
            .company_redemptions(&f.shopper, QueryWindow::default())
            .await;
        assert!(matches!(denied, Err(CoreError::Forbidden(_))));
    }

    impl Fixture {
        fn ledger_storage(&self) -> Arc<dyn TruequeStorage> {
            self.manager.storage.clone()
        }
    }
}
