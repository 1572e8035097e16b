//! In-memory reference implementation of the trueque storage traits.
//!
//! Deterministic and test-friendly. One writer lock over the whole state
//! stands in for the transaction boundary of the durable backend: every
//! mutating operation is serialized, and compound operations validate fully
//! before touching any table.

use crate::model::{
    CatalogFilter, CompanyId, CompanyPatch, CompanyRecord, ListingId, ListingPatch, ListingRecord,
    NewCompany, NewListing, NewRedemption, NewReward, NewTrade, NewTradeMessage, NewUser,
    PostingDraft, PostingId, PostingRecord, RedemptionId, RedemptionRecord, RedemptionStatus,
    RewardId, RewardRecord, SettingRecord, TradeId, TradeMessageId, TradeMessageRecord,
    TradeRecord, TradeStatus, UserId, UserRecord,
};
use crate::traits::{
    CompanyStore, LedgerStore, ListingStore, QueryWindow, RewardStore, SettingStore, TradeStore,
    UserStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct State {
    next_user: i64,
    next_posting: i64,
    next_listing: i64,
    next_trade: i64,
    next_message: i64,
    next_reward: i64,
    next_redemption: i64,
    next_company: i64,
    users: BTreeMap<i64, UserRecord>,
    postings: Vec<PostingRecord>,
    listings: BTreeMap<i64, ListingRecord>,
    trades: BTreeMap<i64, TradeRecord>,
    messages: Vec<TradeMessageRecord>,
    rewards: BTreeMap<i64, RewardRecord>,
    redemptions: BTreeMap<i64, RedemptionRecord>,
    companies: BTreeMap<i64, CompanyRecord>,
    settings: BTreeMap<String, SettingRecord>,
}

/// In-memory trueque storage engine.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
    }
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// Validate all legs against current balances, then commit postings and
/// balance updates. No table is touched unless every leg passes.
fn apply_postings(state: &mut State, legs: &[PostingDraft]) -> StorageResult<Vec<PostingRecord>> {
    let mut balances: BTreeMap<i64, Decimal> = BTreeMap::new();
    for leg in legs {
        let balance = match balances.entry(leg.user_id.0) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let user = state.users.get(&leg.user_id.0).ok_or_else(|| {
                    StorageError::NotFound(format!("user {} not found", leg.user_id))
                })?;
                entry.insert(user.balance)
            }
        };
        let next = *balance + leg.amount;
        if leg.amount < Decimal::ZERO && !leg.bypasses_sufficiency() && next < Decimal::ZERO {
            return Err(StorageError::InsufficientFunds(format!(
                "balance of user {} would drop to {}",
                leg.user_id, next
            )));
        }
        *balance = next;
    }

    let now = Utc::now();
    let mut records = Vec::with_capacity(legs.len());
    for leg in legs {
        let record = PostingRecord {
            id: PostingId(next_id(&mut state.next_posting)),
            user_id: leg.user_id,
            amount: leg.amount,
            kind: leg.kind,
            reference_type: leg.reference_type,
            reference_id: leg.reference_id,
            note: leg.note.clone(),
            created_at: now,
        };
        state.postings.push(record.clone());
        records.push(record);
    }
    for (user_id, balance) in balances {
        if let Some(user) = state.users.get_mut(&user_id) {
            user.balance = balance;
        }
    }
    Ok(records)
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

fn matches_filter(listing: &ListingRecord, filter: &CatalogFilter) -> bool {
    if !listing.is_published || !listing.is_available {
        return false;
    }
    if let Some(owner) = filter.owner {
        if listing.owner_user_id != owner {
            return false;
        }
    }
    if let Some(text) = &filter.text {
        let needle = text.to_lowercase();
        if !listing.title.to_lowercase().contains(&needle)
            && !listing.description.to_lowercase().contains(&needle)
        {
            return false;
        }
    }
    if let Some(min) = filter.min_value {
        if listing.value_true_coins < min {
            return false;
        }
    }
    if let Some(max) = filter.max_value {
        if listing.value_true_coins > max {
            return false;
        }
    }
    if let Some(near) = filter.near {
        match (listing.latitude, listing.longitude) {
            (Some(lat), Some(lng)) => {
                if haversine_km(near.latitude, near.longitude, lat, lng) > near.radius_km {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

#[async_trait]
impl UserStore for InMemoryStorage {
    async fn create_user(&self, user: NewUser) -> StorageResult<UserRecord> {
        let mut state = self.write()?;
        if state.users.values().any(|u| u.email == user.email) {
            return Err(StorageError::Conflict(format!(
                "email {} already registered",
                user.email
            )));
        }
        let record = UserRecord {
            id: UserId(next_id(&mut state.next_user)),
            email: user.email,
            display_name: user.display_name,
            role: user.role,
            company_id: user.company_id,
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        };
        state.users.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_user(&self, id: UserId) -> StorageResult<Option<UserRecord>> {
        Ok(self.read()?.users.get(&id.0).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> StorageResult<Option<UserRecord>> {
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStorage {
    async fn append_postings(&self, legs: Vec<PostingDraft>) -> StorageResult<Vec<PostingRecord>> {
        let mut state = self.write()?;
        apply_postings(&mut state, &legs)
    }

    async fn balance(&self, user: UserId) -> StorageResult<Decimal> {
        let state = self.read()?;
        state
            .users
            .get(&user.0)
            .map(|u| u.balance)
            .ok_or_else(|| StorageError::NotFound(format!("user {} not found", user)))
    }

    async fn list_postings(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<PostingRecord>> {
        let state = self.read()?;
        let values = state
            .postings
            .iter()
            .rev()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect::<Vec<_>>();
        Ok(apply_window(values, window))
    }

    async fn sum_postings(&self, user: UserId) -> StorageResult<Decimal> {
        let state = self.read()?;
        Ok(state
            .postings
            .iter()
            .filter(|p| p.user_id == user)
            .map(|p| p.amount)
            .sum())
    }
}

#[async_trait]
impl ListingStore for InMemoryStorage {
    async fn create_listing(&self, listing: NewListing) -> StorageResult<ListingRecord> {
        let mut state = self.write()?;
        let record = ListingRecord {
            id: ListingId(next_id(&mut state.next_listing)),
            owner_user_id: listing.owner_user_id,
            title: listing.title,
            description: listing.description,
            value_true_coins: listing.value_true_coins,
            image_url: listing.image_url,
            latitude: listing.latitude,
            longitude: listing.longitude,
            is_published: true,
            is_available: true,
            created_at: Utc::now(),
        };
        state.listings.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_listing(&self, id: ListingId) -> StorageResult<Option<ListingRecord>> {
        Ok(self.read()?.listings.get(&id.0).cloned())
    }

    async fn update_listing(
        &self,
        id: ListingId,
        patch: ListingPatch,
    ) -> StorageResult<ListingRecord> {
        let mut state = self.write()?;
        let listing = state
            .listings
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::NotFound(format!("listing {} not found", id)))?;
        if let Some(title) = patch.title {
            listing.title = title;
        }
        if let Some(description) = patch.description {
            listing.description = description;
        }
        if let Some(value) = patch.value_true_coins {
            listing.value_true_coins = value;
        }
        if let Some(image_url) = patch.image_url {
            listing.image_url = Some(image_url);
        }
        if let Some(is_published) = patch.is_published {
            listing.is_published = is_published;
        }
        if let Some(is_available) = patch.is_available {
            listing.is_available = is_available;
        }
        Ok(listing.clone())
    }

    async fn delete_listing(&self, id: ListingId) -> StorageResult<ListingRecord> {
        let mut state = self.write()?;
        state
            .listings
            .remove(&id.0)
            .ok_or_else(|| StorageError::NotFound(format!("listing {} not found", id)))
    }

    async fn catalog(
        &self,
        filter: CatalogFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<ListingRecord>> {
        let state = self.read()?;
        let mut values = state
            .listings
            .values()
            .filter(|l| matches_filter(l, &filter))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(apply_window(values, window))
    }

    async fn listings_by_owner(&self, owner: UserId) -> StorageResult<Vec<ListingRecord>> {
        let state = self.read()?;
        let mut values = state
            .listings
            .values()
            .filter(|l| l.owner_user_id == owner)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(values)
    }
}

#[async_trait]
impl TradeStore for InMemoryStorage {
    async fn create_trade(&self, trade: NewTrade) -> StorageResult<TradeRecord> {
        let mut state = self.write()?;
        let now = Utc::now();
        let record = TradeRecord {
            id: TradeId(next_id(&mut state.next_trade)),
            requester_user_id: trade.requester_user_id,
            owner_user_id: trade.owner_user_id,
            target_listing_id: trade.target_listing_id,
            offered_listing_id: trade.offered_listing_id,
            offered_true_coins: trade.offered_true_coins,
            requested_true_coins: trade.requested_true_coins,
            status: TradeStatus::Pending,
            message: trade.message,
            created_at: now,
            updated_at: now,
        };
        state.trades.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_trade(&self, id: TradeId) -> StorageResult<Option<TradeRecord>> {
        Ok(self.read()?.trades.get(&id.0).cloned())
    }

    async fn transition_trade(
        &self,
        id: TradeId,
        expected_from: TradeStatus,
        to: TradeStatus,
    ) -> StorageResult<TradeRecord> {
        let mut state = self.write()?;
        let trade = state
            .trades
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::NotFound(format!("trade {} not found", id)))?;
        if trade.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid trade transition: expected {:?}, found {:?}",
                expected_from, trade.status
            )));
        }
        trade.status = to;
        trade.updated_at = Utc::now();
        Ok(trade.clone())
    }

    async fn complete_trade(
        &self,
        id: TradeId,
        legs: Vec<PostingDraft>,
    ) -> StorageResult<TradeRecord> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let current = state
            .trades
            .get(&id.0)
            .map(|t| t.status)
            .ok_or_else(|| StorageError::NotFound(format!("trade {} not found", id)))?;
        if current != TradeStatus::Accepted {
            return Err(StorageError::InvariantViolation(format!(
                "invalid trade transition: expected Accepted, found {:?}",
                current
            )));
        }
        apply_postings(state, &legs)?;
        let trade = state
            .trades
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::NotFound(format!("trade {} not found", id)))?;
        trade.status = TradeStatus::Completed;
        trade.updated_at = Utc::now();
        Ok(trade.clone())
    }

    async fn trades_for_user(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<TradeRecord>> {
        let state = self.read()?;
        let mut values = state
            .trades
            .values()
            .filter(|t| t.is_participant(user))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(apply_window(values, window))
    }

    async fn append_trade_message(
        &self,
        message: NewTradeMessage,
    ) -> StorageResult<TradeMessageRecord> {
        let mut state = self.write()?;
        if !state.trades.contains_key(&message.trade_id.0) {
            return Err(StorageError::NotFound(format!(
                "trade {} not found",
                message.trade_id
            )));
        }
        let record = TradeMessageRecord {
            id: TradeMessageId(next_id(&mut state.next_message)),
            trade_id: message.trade_id,
            sender_user_id: message.sender_user_id,
            body: message.body,
            created_at: Utc::now(),
        };
        state.messages.push(record.clone());
        Ok(record)
    }

    async fn list_trade_messages(
        &self,
        trade: TradeId,
    ) -> StorageResult<Vec<TradeMessageRecord>> {
        let state = self.read()?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.trade_id == trade)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RewardStore for InMemoryStorage {
    async fn create_reward(&self, reward: NewReward) -> StorageResult<RewardRecord> {
        let mut state = self.write()?;
        let record = RewardRecord {
            id: RewardId(next_id(&mut state.next_reward)),
            company_id: reward.company_id,
            title: reward.title,
            description: reward.description,
            cost_true_coins: reward.cost_true_coins,
            image_url: reward.image_url,
            is_active: true,
            created_at: Utc::now(),
        };
        state.rewards.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_reward(&self, id: RewardId) -> StorageResult<Option<RewardRecord>> {
        Ok(self.read()?.rewards.get(&id.0).cloned())
    }

    async fn set_reward_active(&self, id: RewardId, active: bool) -> StorageResult<RewardRecord> {
        let mut state = self.write()?;
        let reward = state
            .rewards
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::NotFound(format!("reward {} not found", id)))?;
        reward.is_active = active;
        Ok(reward.clone())
    }

    async fn list_active_rewards(&self, window: QueryWindow) -> StorageResult<Vec<RewardRecord>> {
        let state = self.read()?;
        let mut values = state
            .rewards
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(apply_window(values, window))
    }

    async fn rewards_by_company(
        &self,
        company: CompanyId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RewardRecord>> {
        let state = self.read()?;
        let mut values = state
            .rewards
            .values()
            .filter(|r| r.company_id == company)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(apply_window(values, window))
    }

    async fn create_redemption(
        &self,
        redemption: NewRedemption,
        debit: PostingDraft,
    ) -> StorageResult<RedemptionRecord> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        if state.redemptions.values().any(|r| r.code == redemption.code) {
            return Err(StorageError::Conflict(format!(
                "voucher code {} already exists",
                redemption.code
            )));
        }
        apply_postings(state, &[debit])?;
        let record = RedemptionRecord {
            id: RedemptionId(next_id(&mut state.next_redemption)),
            reward_id: redemption.reward_id,
            user_id: redemption.user_id,
            code: redemption.code,
            status: RedemptionStatus::Pending,
            created_at: Utc::now(),
            redeemed_at: None,
        };
        state.redemptions.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_redemption(&self, id: RedemptionId) -> StorageResult<Option<RedemptionRecord>> {
        Ok(self.read()?.redemptions.get(&id.0).cloned())
    }

    async fn transition_redemption(
        &self,
        id: RedemptionId,
        expected_from: RedemptionStatus,
        to: RedemptionStatus,
    ) -> StorageResult<RedemptionRecord> {
        let mut state = self.write()?;
        let redemption = state
            .redemptions
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::NotFound(format!("redemption {} not found", id)))?;
        if redemption.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid redemption transition: expected {:?}, found {:?}",
                expected_from, redemption.status
            )));
        }
        redemption.status = to;
        if to == RedemptionStatus::Redeemed {
            redemption.redeemed_at = Some(Utc::now());
        }
        Ok(redemption.clone())
    }

    async fn redemptions_by_user(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RedemptionRecord>> {
        let state = self.read()?;
        let mut values = state
            .redemptions
            .values()
            .filter(|r| r.user_id == user)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(apply_window(values, window))
    }

    async fn redemptions_by_company(
        &self,
        company: CompanyId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RedemptionRecord>> {
        let state = self.read()?;
        let mut values = state
            .redemptions
            .values()
            .filter(|r| {
                state
                    .rewards
                    .get(&r.reward_id.0)
                    .map(|reward| reward.company_id == company)
                    .unwrap_or(false)
            })
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(apply_window(values, window))
    }
}

#[async_trait]
impl CompanyStore for InMemoryStorage {
    async fn create_company(&self, company: NewCompany) -> StorageResult<CompanyRecord> {
        let mut state = self.write()?;
        let record = CompanyRecord {
            id: CompanyId(next_id(&mut state.next_company)),
            name: company.name,
            description: company.description,
            phone: company.phone,
            address: company.address,
            is_active: true,
            created_at: Utc::now(),
        };
        state.companies.insert(record.id.0, record.clone());
        Ok(record)
    }

    async fn get_company(&self, id: CompanyId) -> StorageResult<Option<CompanyRecord>> {
        Ok(self.read()?.companies.get(&id.0).cloned())
    }

    async fn update_company(
        &self,
        id: CompanyId,
        patch: CompanyPatch,
    ) -> StorageResult<CompanyRecord> {
        let mut state = self.write()?;
        let company = state
            .companies
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::NotFound(format!("company {} not found", id)))?;
        if let Some(name) = patch.name {
            company.name = name;
        }
        if let Some(description) = patch.description {
            company.description = Some(description);
        }
        if let Some(phone) = patch.phone {
            company.phone = Some(phone);
        }
        if let Some(address) = patch.address {
            company.address = Some(address);
        }
        if let Some(is_active) = patch.is_active {
            company.is_active = is_active;
        }
        Ok(company.clone())
    }

    async fn list_companies(&self, active_only: bool) -> StorageResult<Vec<CompanyRecord>> {
        let state = self.read()?;
        Ok(state
            .companies
            .values()
            .filter(|c| !active_only || c.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettingStore for InMemoryStorage {
    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<SettingRecord> {
        let mut state = self.write()?;
        let record = SettingRecord {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now(),
        };
        state.settings.insert(key.to_string(), record.clone());
        Ok(record)
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<SettingRecord>> {
        Ok(self.read()?.settings.get(key).cloned())
    }

    async fn delete_setting(&self, key: &str) -> StorageResult<()> {
        let mut state = self.write()?;
        state
            .settings
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("setting {} not found", key)))
    }

    async fn list_settings(&self) -> StorageResult<Vec<SettingRecord>> {
        Ok(self.read()?.settings.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PostingKind, ReferenceType};
    use rust_decimal_macros::dec;

    async fn seed_user(storage: &InMemoryStorage, email: &str, balance: Decimal) -> UserRecord {
        let user = storage
            .create_user(NewUser {
                email: email.to_string(),
                display_name: email.to_string(),
                role: crate::model::Role::User,
                company_id: None,
            })
            .await
            .unwrap();
        if balance != Decimal::ZERO {
            storage
                .append_postings(vec![PostingDraft::new(
                    user.id,
                    balance,
                    PostingKind::AdminAdjustment,
                    ReferenceType::Admin,
                )])
                .await
                .unwrap();
        }
        user
    }

    #[tokio::test]
    async fn overdraw_is_rejected_and_leaves_no_posting() {
        let storage = InMemoryStorage::new();
        let user = seed_user(&storage, "a@example.com", dec!(10)).await;

        let result = storage
            .append_postings(vec![PostingDraft::new(
                user.id,
                dec!(-25),
                PostingKind::RewardSpend,
                ReferenceType::Reward,
            )])
            .await;

        assert!(matches!(result, Err(StorageError::InsufficientFunds(_))));
        assert_eq!(storage.balance(user.id).await.unwrap(), dec!(10));
        assert_eq!(
            storage
                .list_postings(user.id, QueryWindow::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn multi_leg_append_is_all_or_nothing() {
        let storage = InMemoryStorage::new();
        let a = seed_user(&storage, "a@example.com", dec!(100)).await;
        let b = seed_user(&storage, "b@example.com", dec!(0)).await;

        let result = storage
            .append_postings(vec![
                PostingDraft::new(
                    a.id,
                    dec!(-40),
                    PostingKind::TradeTransferOut,
                    ReferenceType::Trade,
                ),
                PostingDraft::new(
                    b.id,
                    dec!(-1),
                    PostingKind::TradeTransferOut,
                    ReferenceType::Trade,
                ),
            ])
            .await;

        assert!(matches!(result, Err(StorageError::InsufficientFunds(_))));
        assert_eq!(storage.balance(a.id).await.unwrap(), dec!(100));
        assert_eq!(storage.balance(b.id).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn admin_adjustment_may_go_negative() {
        let storage = InMemoryStorage::new();
        let user = seed_user(&storage, "a@example.com", dec!(5)).await;

        storage
            .append_postings(vec![PostingDraft::new(
                user.id,
                dec!(-20),
                PostingKind::AdminAdjustment,
                ReferenceType::Admin,
            )
            .with_note("chargeback")])
            .await
            .unwrap();

        assert_eq!(storage.balance(user.id).await.unwrap(), dec!(-15));
        assert_eq!(storage.sum_postings(user.id).await.unwrap(), dec!(-15));
    }

    #[tokio::test]
    async fn trade_transition_checks_expected_state() {
        let storage = InMemoryStorage::new();
        let a = seed_user(&storage, "a@example.com", dec!(0)).await;
        let b = seed_user(&storage, "b@example.com", dec!(0)).await;
        let listing = storage
            .create_listing(NewListing {
                owner_user_id: b.id,
                title: "bicycle".to_string(),
                description: "city bike".to_string(),
                value_true_coins: dec!(50),
                image_url: None,
                latitude: None,
                longitude: None,
            })
            .await
            .unwrap();
        let trade = storage
            .create_trade(NewTrade {
                requester_user_id: a.id,
                owner_user_id: b.id,
                target_listing_id: listing.id,
                offered_listing_id: None,
                offered_true_coins: Decimal::ZERO,
                requested_true_coins: Decimal::ZERO,
                message: None,
            })
            .await
            .unwrap();

        let result = storage
            .transition_trade(trade.id, TradeStatus::Accepted, TradeStatus::Completed)
            .await;
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));

        let accepted = storage
            .transition_trade(trade.id, TradeStatus::Pending, TradeStatus::Accepted)
            .await
            .unwrap();
        assert_eq!(accepted.status, TradeStatus::Accepted);
    }

    #[tokio::test]
    async fn failed_completion_leg_leaves_trade_accepted() {
        let storage = InMemoryStorage::new();
        let a = seed_user(&storage, "a@example.com", dec!(5)).await;
        let b = seed_user(&storage, "b@example.com", dec!(0)).await;
        let listing = storage
            .create_listing(NewListing {
                owner_user_id: b.id,
                title: "lamp".to_string(),
                description: "desk lamp".to_string(),
                value_true_coins: dec!(20),
                image_url: None,
                latitude: None,
                longitude: None,
            })
            .await
            .unwrap();
        let trade = storage
            .create_trade(NewTrade {
                requester_user_id: a.id,
                owner_user_id: b.id,
                target_listing_id: listing.id,
                offered_listing_id: None,
                offered_true_coins: dec!(20),
                requested_true_coins: Decimal::ZERO,
                message: None,
            })
            .await
            .unwrap();
        storage
            .transition_trade(trade.id, TradeStatus::Pending, TradeStatus::Accepted)
            .await
            .unwrap();

        let result = storage
            .complete_trade(
                trade.id,
                vec![
                    PostingDraft::new(
                        a.id,
                        dec!(-20),
                        PostingKind::TradeTransferOut,
                        ReferenceType::Trade,
                    )
                    .with_reference(trade.id.0),
                    PostingDraft::new(
                        b.id,
                        dec!(20),
                        PostingKind::TradeTransferIn,
                        ReferenceType::Trade,
                    )
                    .with_reference(trade.id.0),
                ],
            )
            .await;

        assert!(matches!(result, Err(StorageError::InsufficientFunds(_))));
        let stored = storage.get_trade(trade.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Accepted);
        assert_eq!(storage.balance(a.id).await.unwrap(), dec!(5));
        assert_eq!(storage.balance(b.id).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn redemption_code_collision_is_a_conflict() {
        let storage = InMemoryStorage::new();
        let user = seed_user(&storage, "a@example.com", dec!(100)).await;
        let company = storage
            .create_company(NewCompany {
                name: "cafe".to_string(),
                description: None,
                phone: None,
                address: None,
            })
            .await
            .unwrap();
        let reward = storage
            .create_reward(NewReward {
                company_id: company.id,
                title: "coffee".to_string(),
                description: None,
                cost_true_coins: dec!(10),
                image_url: None,
            })
            .await
            .unwrap();

        let debit = PostingDraft::new(
            user.id,
            dec!(-10),
            PostingKind::RewardSpend,
            ReferenceType::Reward,
        )
        .with_reference(reward.id.0);

        storage
            .create_redemption(
                NewRedemption {
                    reward_id: reward.id,
                    user_id: user.id,
                    code: "ABCDEF1234".to_string(),
                },
                debit.clone(),
            )
            .await
            .unwrap();

        let result = storage
            .create_redemption(
                NewRedemption {
                    reward_id: reward.id,
                    user_id: user.id,
                    code: "ABCDEF1234".to_string(),
                },
                debit,
            )
            .await;

        assert!(matches!(result, Err(StorageError::Conflict(_))));
        // The failed attempt must not have debited.
        assert_eq!(storage.balance(user.id).await.unwrap(), dec!(90));
    }

    #[tokio::test]
    async fn catalog_applies_text_value_and_proximity_filters() {
        let storage = InMemoryStorage::new();
        let owner = seed_user(&storage, "a@example.com", dec!(0)).await;
        for (title, value, lat, lng) in [
            ("red bicycle", dec!(50), Some(-16.50), Some(-68.15)),
            ("blue couch", dec!(200), Some(-16.51), Some(-68.12)),
            ("old bicycle bell", dec!(5), None, None),
        ] {
            storage
                .create_listing(NewListing {
                    owner_user_id: owner.id,
                    title: title.to_string(),
                    description: String::new(),
                    value_true_coins: value,
                    image_url: None,
                    latitude: lat,
                    longitude: lng,
                })
                .await
                .unwrap();
        }

        let by_text = storage
            .catalog(
                CatalogFilter {
                    text: Some("Bicycle".to_string()),
                    ..CatalogFilter::default()
                },
                QueryWindow::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_text.len(), 2);

        let by_value = storage
            .catalog(
                CatalogFilter {
                    min_value: Some(dec!(10)),
                    max_value: Some(dec!(100)),
                    ..CatalogFilter::default()
                },
                QueryWindow::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_value.len(), 1);
        assert_eq!(by_value[0].title, "red bicycle");

        // Listings without coordinates never match a proximity filter.
        let nearby = storage
            .catalog(
                CatalogFilter {
                    near: Some(crate::model::GeoFilter {
                        latitude: -16.50,
                        longitude: -68.15,
                        radius_km: 5.0,
                    }),
                    ..CatalogFilter::default()
                },
                QueryWindow::default(),
            )
            .await
            .unwrap();
        assert_eq!(nearby.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let storage = InMemoryStorage::new();
        seed_user(&storage, "a@example.com", dec!(0)).await;
        let result = storage
            .create_user(NewUser {
                email: "a@example.com".to_string(),
                display_name: "other".to_string(),
                role: crate::model::Role::User,
                company_id: None,
            })
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }
}
