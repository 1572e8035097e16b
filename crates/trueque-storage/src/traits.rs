use crate::model::{
    CatalogFilter, CompanyId, CompanyPatch, CompanyRecord, ListingId, ListingPatch, ListingRecord,
    NewCompany, NewListing, NewRedemption, NewReward, NewTrade, NewTradeMessage, NewUser,
    PostingDraft, PostingRecord, RedemptionId, RedemptionRecord, RedemptionStatus, RewardId,
    RewardRecord, SettingRecord, TradeId, TradeMessageRecord, TradeRecord, TradeStatus, UserId,
    UserRecord,
};
use crate::StorageResult;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Generic query window for paged reads. A zero limit means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl QueryWindow {
    pub fn limited(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }
}

/// Storage interface for user accounts.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user with a zero balance. Fails with `Conflict` on a
    /// duplicate email.
    async fn create_user(&self, user: NewUser) -> StorageResult<UserRecord>;

    async fn get_user(&self, id: UserId) -> StorageResult<Option<UserRecord>>;

    async fn get_user_by_email(&self, email: &str) -> StorageResult<Option<UserRecord>>;
}

/// Storage interface for the posting ledger and cached balances.
///
/// The engine is the sole writer of balances; every balance mutation happens
/// inside `append_postings` (or a compound operation that embeds the same
/// logic) under the engine's transaction boundary.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one or more postings and update the affected balances in a
    /// single atomic transaction. Legs are applied in order; a debit that
    /// would drive a balance negative fails the whole append with
    /// `InsufficientFunds` unless the leg bypasses the sufficiency check.
    /// Unknown users fail with `NotFound`. All-or-nothing.
    async fn append_postings(&self, legs: Vec<PostingDraft>) -> StorageResult<Vec<PostingRecord>>;

    /// Current cached balance, reflecting every committed posting.
    async fn balance(&self, user: UserId) -> StorageResult<Decimal>;

    /// Postings for a user, newest first.
    async fn list_postings(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<PostingRecord>>;

    /// Recomputed sum of the user's postings, for reconciliation against the
    /// cached balance.
    async fn sum_postings(&self, user: UserId) -> StorageResult<Decimal>;
}

/// Storage interface for listings and the public catalog.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn create_listing(&self, listing: NewListing) -> StorageResult<ListingRecord>;

    async fn get_listing(&self, id: ListingId) -> StorageResult<Option<ListingRecord>>;

    async fn update_listing(
        &self,
        id: ListingId,
        patch: ListingPatch,
    ) -> StorageResult<ListingRecord>;

    /// Remove a listing and return the deleted record.
    async fn delete_listing(&self, id: ListingId) -> StorageResult<ListingRecord>;

    /// Published, available listings matching the filter, newest first.
    async fn catalog(
        &self,
        filter: CatalogFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<ListingRecord>>;

    /// All of an owner's listings regardless of visibility, newest first.
    async fn listings_by_owner(&self, owner: UserId) -> StorageResult<Vec<ListingRecord>>;
}

/// Storage interface for trade negotiations and their conversations.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn create_trade(&self, trade: NewTrade) -> StorageResult<TradeRecord>;

    async fn get_trade(&self, id: TradeId) -> StorageResult<Option<TradeRecord>>;

    /// Compare-and-set status transition. Fails with `InvariantViolation`
    /// when the stored status is not `expected_from`, `NotFound` when the
    /// trade does not exist.
    async fn transition_trade(
        &self,
        id: TradeId,
        expected_from: TradeStatus,
        to: TradeStatus,
    ) -> StorageResult<TradeRecord>;

    /// Move an `Accepted` trade to `Completed` and post the agreed transfer
    /// legs inside one atomic transaction. If any leg fails the trade status
    /// is unchanged and no posting exists.
    async fn complete_trade(
        &self,
        id: TradeId,
        legs: Vec<PostingDraft>,
    ) -> StorageResult<TradeRecord>;

    /// Trades in which the user is requester or owner, newest first.
    async fn trades_for_user(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<TradeRecord>>;

    async fn append_trade_message(
        &self,
        message: NewTradeMessage,
    ) -> StorageResult<TradeMessageRecord>;

    /// Messages of a trade, oldest first.
    async fn list_trade_messages(&self, trade: TradeId)
        -> StorageResult<Vec<TradeMessageRecord>>;
}

/// Storage interface for the reward catalog and redemptions.
#[async_trait]
pub trait RewardStore: Send + Sync {
    async fn create_reward(&self, reward: NewReward) -> StorageResult<RewardRecord>;

    async fn get_reward(&self, id: RewardId) -> StorageResult<Option<RewardRecord>>;

    async fn set_reward_active(&self, id: RewardId, active: bool) -> StorageResult<RewardRecord>;

    /// Active rewards, newest first.
    async fn list_active_rewards(&self, window: QueryWindow) -> StorageResult<Vec<RewardRecord>>;

    /// A company's rewards including inactive ones, newest first.
    async fn rewards_by_company(
        &self,
        company: CompanyId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RewardRecord>>;

    /// Insert a `Pending` redemption and post its debit leg inside one
    /// atomic transaction. Fails with `Conflict` when the voucher code is
    /// already taken; never debits without vending, never vends without
    /// debiting.
    async fn create_redemption(
        &self,
        redemption: NewRedemption,
        debit: PostingDraft,
    ) -> StorageResult<RedemptionRecord>;

    async fn get_redemption(&self, id: RedemptionId) -> StorageResult<Option<RedemptionRecord>>;

    /// Compare-and-set redemption transition. Sets the redemption timestamp
    /// when moving to `Redeemed`.
    async fn transition_redemption(
        &self,
        id: RedemptionId,
        expected_from: RedemptionStatus,
        to: RedemptionStatus,
    ) -> StorageResult<RedemptionRecord>;

    /// A user's redemptions, newest first.
    async fn redemptions_by_user(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RedemptionRecord>>;

    /// Redemptions against a company's rewards, newest first.
    async fn redemptions_by_company(
        &self,
        company: CompanyId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RedemptionRecord>>;
}

/// Storage interface for the company directory.
#[async_trait]
pub trait CompanyStore: Send + Sync {
    async fn create_company(&self, company: NewCompany) -> StorageResult<CompanyRecord>;

    async fn get_company(&self, id: CompanyId) -> StorageResult<Option<CompanyRecord>>;

    async fn update_company(
        &self,
        id: CompanyId,
        patch: CompanyPatch,
    ) -> StorageResult<CompanyRecord>;

    async fn list_companies(&self, active_only: bool) -> StorageResult<Vec<CompanyRecord>>;
}

/// Storage interface for admin settings.
#[async_trait]
pub trait SettingStore: Send + Sync {
    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<SettingRecord>;

    async fn get_setting(&self, key: &str) -> StorageResult<Option<SettingRecord>>;

    /// Fails with `NotFound` when the key is absent.
    async fn delete_setting(&self, key: &str) -> StorageResult<()>;

    async fn list_settings(&self) -> StorageResult<Vec<SettingRecord>>;
}

/// Unified storage bundle used by the trueque domain services.
pub trait TruequeStorage:
    UserStore
    + LedgerStore
    + ListingStore
    + TradeStore
    + RewardStore
    + CompanyStore
    + SettingStore
    + Send
    + Sync
{
}

impl<T> TruequeStorage for T where
    T: UserStore
        + LedgerStore
        + ListingStore
        + TradeStore
        + RewardStore
        + CompanyStore
        + SettingStore
        + Send
        + Sync
{
}
