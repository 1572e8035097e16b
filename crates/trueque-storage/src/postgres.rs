//! PostgreSQL storage engine.
//!
//! Schema is created on connect. Compound operations (posting appends, trade
//! completion, redemption creation) run in a single transaction; balance
//! checks take row locks on the affected users, in ascending id order.

use crate::model::{
    CatalogFilter, CompanyId, CompanyPatch, CompanyRecord, ListingId, ListingPatch, ListingRecord,
    NewCompany, NewListing, NewRedemption, NewReward, NewTrade, NewTradeMessage, NewUser,
    PostingDraft, PostingId, PostingKind, PostingRecord, RedemptionId, RedemptionRecord,
    RedemptionStatus, ReferenceType, RewardId, RewardRecord, Role, SettingRecord, TradeId,
    TradeMessageId, TradeMessageRecord, TradeRecord, TradeStatus, UserId, UserRecord,
};
use crate::traits::{
    CompanyStore, LedgerStore, ListingStore, QueryWindow, RewardStore, SettingStore, TradeStore,
    UserStore,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeMap;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS trueque_users (
        id BIGSERIAL PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        role TEXT NOT NULL,
        company_id BIGINT,
        balance NUMERIC NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS trueque_postings (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES trueque_users(id),
        amount NUMERIC NOT NULL,
        kind TEXT NOT NULL,
        reference_type TEXT NOT NULL,
        reference_id BIGINT,
        note TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS trueque_postings_user_idx
        ON trueque_postings (user_id, id DESC)",
    "CREATE TABLE IF NOT EXISTS trueque_listings (
        id BIGSERIAL PRIMARY KEY,
        owner_user_id BIGINT NOT NULL REFERENCES trueque_users(id),
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        value_true_coins NUMERIC NOT NULL,
        image_url TEXT,
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        is_published BOOLEAN NOT NULL DEFAULT TRUE,
        is_available BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS trueque_trades (
        id BIGSERIAL PRIMARY KEY,
        requester_user_id BIGINT NOT NULL REFERENCES trueque_users(id),
        owner_user_id BIGINT NOT NULL REFERENCES trueque_users(id),
        target_listing_id BIGINT NOT NULL,
        offered_listing_id BIGINT,
        offered_true_coins NUMERIC NOT NULL DEFAULT 0,
        requested_true_coins NUMERIC NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS trueque_trades_requester_idx
        ON trueque_trades (requester_user_id, id DESC)",
    "CREATE INDEX IF NOT EXISTS trueque_trades_owner_idx
        ON trueque_trades (owner_user_id, id DESC)",
    "CREATE TABLE IF NOT EXISTS trueque_trade_messages (
        id BIGSERIAL PRIMARY KEY,
        trade_id BIGINT NOT NULL REFERENCES trueque_trades(id),
        sender_user_id BIGINT NOT NULL REFERENCES trueque_users(id),
        body TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS trueque_companies (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        phone TEXT,
        address TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS trueque_rewards (
        id BIGSERIAL PRIMARY KEY,
        company_id BIGINT NOT NULL REFERENCES trueque_companies(id),
        title TEXT NOT NULL,
        description TEXT,
        cost_true_coins NUMERIC NOT NULL,
        image_url TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS trueque_redemptions (
        id BIGSERIAL PRIMARY KEY,
        reward_id BIGINT NOT NULL REFERENCES trueque_rewards(id),
        user_id BIGINT NOT NULL REFERENCES trueque_users(id),
        code TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        redeemed_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS trueque_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
];

/// PostgreSQL-backed trueque storage engine.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to the database and ensure the schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(backend)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(backend)?;
        }
        Ok(Self { pool })
    }
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Map a unique-constraint violation (SQLSTATE 23505) to `Conflict`.
fn map_conflict(e: sqlx::Error, what: &str) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            return StorageError::Conflict(format!("{what} already exists"));
        }
    }
    backend(e)
}

/// Map a foreign-key violation (SQLSTATE 23503) to `NotFound`.
fn map_missing_parent(e: sqlx::Error, what: String) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23503") {
            return StorageError::NotFound(what);
        }
    }
    backend(e)
}

fn limit_bind(window: QueryWindow) -> Option<i64> {
    if window.limit == 0 {
        None
    } else {
        Some(window.limit as i64)
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Company => "company",
        Role::Admin => "admin",
    }
}

fn parse_role(s: &str) -> StorageResult<Role> {
    match s {
        "user" => Ok(Role::User),
        "company" => Ok(Role::Company),
        "admin" => Ok(Role::Admin),
        other => Err(StorageError::Serialization(format!("unknown role {other}"))),
    }
}

fn posting_kind_str(kind: PostingKind) -> &'static str {
    match kind {
        PostingKind::RewardSpend => "reward_spend",
        PostingKind::AdminAdjustment => "admin_adjustment",
        PostingKind::TradeTransferIn => "trade_transfer_in",
        PostingKind::TradeTransferOut => "trade_transfer_out",
    }
}

fn parse_posting_kind(s: &str) -> StorageResult<PostingKind> {
    match s {
        "reward_spend" => Ok(PostingKind::RewardSpend),
        "admin_adjustment" => Ok(PostingKind::AdminAdjustment),
        "trade_transfer_in" => Ok(PostingKind::TradeTransferIn),
        "trade_transfer_out" => Ok(PostingKind::TradeTransferOut),
        other => Err(StorageError::Serialization(format!(
            "unknown posting kind {other}"
        ))),
    }
}

fn reference_type_str(reference: ReferenceType) -> &'static str {
    match reference {
        ReferenceType::Trade => "trade",
        ReferenceType::Reward => "reward",
        ReferenceType::Admin => "admin",
    }
}

fn parse_reference_type(s: &str) -> StorageResult<ReferenceType> {
    match s {
        "trade" => Ok(ReferenceType::Trade),
        "reward" => Ok(ReferenceType::Reward),
        "admin" => Ok(ReferenceType::Admin),
        other => Err(StorageError::Serialization(format!(
            "unknown reference type {other}"
        ))),
    }
}

fn trade_status_str(status: TradeStatus) -> &'static str {
    match status {
        TradeStatus::Pending => "pending",
        TradeStatus::Accepted => "accepted",
        TradeStatus::Completed => "completed",
        TradeStatus::Rejected => "rejected",
        TradeStatus::Cancelled => "cancelled",
    }
}

fn parse_trade_status(s: &str) -> StorageResult<TradeStatus> {
    match s {
        "pending" => Ok(TradeStatus::Pending),
        "accepted" => Ok(TradeStatus::Accepted),
        "completed" => Ok(TradeStatus::Completed),
        "rejected" => Ok(TradeStatus::Rejected),
        "cancelled" => Ok(TradeStatus::Cancelled),
        other => Err(StorageError::Serialization(format!(
            "unknown trade status {other}"
        ))),
    }
}

fn redemption_status_str(status: RedemptionStatus) -> &'static str {
    match status {
        RedemptionStatus::Pending => "pending",
        RedemptionStatus::Redeemed => "redeemed",
        RedemptionStatus::Cancelled => "cancelled",
    }
}

fn parse_redemption_status(s: &str) -> StorageResult<RedemptionStatus> {
    match s {
        "pending" => Ok(RedemptionStatus::Pending),
        "redeemed" => Ok(RedemptionStatus::Redeemed),
        "cancelled" => Ok(RedemptionStatus::Cancelled),
        other => Err(StorageError::Serialization(format!(
            "unknown redemption status {other}"
        ))),
    }
}

fn user_from_row(row: &PgRow) -> StorageResult<UserRecord> {
    let role: String = row.try_get("role").map_err(backend)?;
    Ok(UserRecord {
        id: UserId(row.try_get("id").map_err(backend)?),
        email: row.try_get("email").map_err(backend)?,
        display_name: row.try_get("display_name").map_err(backend)?,
        role: parse_role(&role)?,
        company_id: row
            .try_get::<Option<i64>, _>("company_id")
            .map_err(backend)?
            .map(CompanyId),
        balance: row.try_get("balance").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn posting_from_row(row: &PgRow) -> StorageResult<PostingRecord> {
    let kind: String = row.try_get("kind").map_err(backend)?;
    let reference_type: String = row.try_get("reference_type").map_err(backend)?;
    Ok(PostingRecord {
        id: PostingId(row.try_get("id").map_err(backend)?),
        user_id: UserId(row.try_get("user_id").map_err(backend)?),
        amount: row.try_get("amount").map_err(backend)?,
        kind: parse_posting_kind(&kind)?,
        reference_type: parse_reference_type(&reference_type)?,
        reference_id: row.try_get("reference_id").map_err(backend)?,
        note: row.try_get("note").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn listing_from_row(row: &PgRow) -> StorageResult<ListingRecord> {
    Ok(ListingRecord {
        id: ListingId(row.try_get("id").map_err(backend)?),
        owner_user_id: UserId(row.try_get("owner_user_id").map_err(backend)?),
        title: row.try_get("title").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        value_true_coins: row.try_get("value_true_coins").map_err(backend)?,
        image_url: row.try_get("image_url").map_err(backend)?,
        latitude: row.try_get("latitude").map_err(backend)?,
        longitude: row.try_get("longitude").map_err(backend)?,
        is_published: row.try_get("is_published").map_err(backend)?,
        is_available: row.try_get("is_available").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn trade_from_row(row: &PgRow) -> StorageResult<TradeRecord> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(TradeRecord {
        id: TradeId(row.try_get("id").map_err(backend)?),
        requester_user_id: UserId(row.try_get("requester_user_id").map_err(backend)?),
        owner_user_id: UserId(row.try_get("owner_user_id").map_err(backend)?),
        target_listing_id: ListingId(row.try_get("target_listing_id").map_err(backend)?),
        offered_listing_id: row
            .try_get::<Option<i64>, _>("offered_listing_id")
            .map_err(backend)?
            .map(ListingId),
        offered_true_coins: row.try_get("offered_true_coins").map_err(backend)?,
        requested_true_coins: row.try_get("requested_true_coins").map_err(backend)?,
        status: parse_trade_status(&status)?,
        message: row.try_get("message").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn trade_message_from_row(row: &PgRow) -> StorageResult<TradeMessageRecord> {
    Ok(TradeMessageRecord {
        id: TradeMessageId(row.try_get("id").map_err(backend)?),
        trade_id: TradeId(row.try_get("trade_id").map_err(backend)?),
        sender_user_id: UserId(row.try_get("sender_user_id").map_err(backend)?),
        body: row.try_get("body").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn reward_from_row(row: &PgRow) -> StorageResult<RewardRecord> {
    Ok(RewardRecord {
        id: RewardId(row.try_get("id").map_err(backend)?),
        company_id: CompanyId(row.try_get("company_id").map_err(backend)?),
        title: row.try_get("title").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        cost_true_coins: row.try_get("cost_true_coins").map_err(backend)?,
        image_url: row.try_get("image_url").map_err(backend)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn redemption_from_row(row: &PgRow) -> StorageResult<RedemptionRecord> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(RedemptionRecord {
        id: RedemptionId(row.try_get("id").map_err(backend)?),
        reward_id: RewardId(row.try_get("reward_id").map_err(backend)?),
        user_id: UserId(row.try_get("user_id").map_err(backend)?),
        code: row.try_get("code").map_err(backend)?,
        status: parse_redemption_status(&status)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        redeemed_at: row.try_get("redeemed_at").map_err(backend)?,
    })
}

fn company_from_row(row: &PgRow) -> StorageResult<CompanyRecord> {
    Ok(CompanyRecord {
        id: CompanyId(row.try_get("id").map_err(backend)?),
        name: row.try_get("name").map_err(backend)?,
        description: row.try_get("description").map_err(backend)?,
        phone: row.try_get("phone").map_err(backend)?,
        address: row.try_get("address").map_err(backend)?,
        is_active: row.try_get("is_active").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn setting_from_row(row: &PgRow) -> StorageResult<SettingRecord> {
    Ok(SettingRecord {
        key: row.try_get("key").map_err(backend)?,
        value: row.try_get("value").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

/// Lock the affected users, validate sufficiency leg by leg, then write the
/// postings and balance updates. Callers own the surrounding transaction.
async fn apply_postings_tx(
    tx: &mut Transaction<'_, Postgres>,
    legs: &[PostingDraft],
) -> StorageResult<Vec<PostingRecord>> {
    // Lock in ascending id order so concurrent appends cannot deadlock.
    let mut balances: BTreeMap<i64, Decimal> = BTreeMap::new();
    for leg in legs {
        balances.entry(leg.user_id.0).or_insert(Decimal::ZERO);
    }
    for (user_id, balance) in balances.iter_mut() {
        let row = sqlx::query("SELECT balance FROM trueque_users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("user {user_id} not found")))?;
        *balance = row.try_get("balance").map_err(backend)?;
    }

    for leg in legs {
        let balance = balances
            .get_mut(&leg.user_id.0)
            .ok_or_else(|| StorageError::NotFound(format!("user {} not found", leg.user_id)))?;
        let next = *balance + leg.amount;
        if leg.amount < Decimal::ZERO && !leg.bypasses_sufficiency() && next < Decimal::ZERO {
            return Err(StorageError::InsufficientFunds(format!(
                "balance of user {} would drop to {}",
                leg.user_id, next
            )));
        }
        *balance = next;
    }

    let mut records = Vec::with_capacity(legs.len());
    for leg in legs {
        let row = sqlx::query(
            "INSERT INTO trueque_postings
                (user_id, amount, kind, reference_type, reference_id, note)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, user_id, amount, kind, reference_type, reference_id, note, created_at",
        )
        .bind(leg.user_id.0)
        .bind(leg.amount)
        .bind(posting_kind_str(leg.kind))
        .bind(reference_type_str(leg.reference_type))
        .bind(leg.reference_id)
        .bind(leg.note.as_deref())
        .fetch_one(&mut **tx)
        .await
        .map_err(backend)?;
        records.push(posting_from_row(&row)?);
    }
    for (user_id, balance) in balances {
        sqlx::query("UPDATE trueque_users SET balance = $1 WHERE id = $2")
            .bind(balance)
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
    }
    Ok(records)
}

#[async_trait]
impl UserStore for PostgresStorage {
    async fn create_user(&self, user: NewUser) -> StorageResult<UserRecord> {
        let row = sqlx::query(
            "INSERT INTO trueque_users (email, display_name, role, company_id)
             VALUES ($1, $2, $3, $4)
             RETURNING id, email, display_name, role, company_id, balance, created_at",
        )
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(role_str(user.role))
        .bind(user.company_id.map(|c| c.0))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_conflict(e, &format!("email {}", user.email)))?;
        user_from_row(&row)
    }

    async fn get_user(&self, id: UserId) -> StorageResult<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, role, company_id, balance, created_at
             FROM trueque_users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> StorageResult<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, email, display_name, role, company_id, balance, created_at
             FROM trueque_users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(user_from_row).transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresStorage {
    async fn append_postings(&self, legs: Vec<PostingDraft>) -> StorageResult<Vec<PostingRecord>> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let records = apply_postings_tx(&mut tx, &legs).await?;
        tx.commit().await.map_err(backend)?;
        Ok(records)
    }

    async fn balance(&self, user: UserId) -> StorageResult<Decimal> {
        let row = sqlx::query("SELECT balance FROM trueque_users WHERE id = $1")
            .bind(user.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("user {user} not found")))?;
        row.try_get("balance").map_err(backend)
    }

    async fn list_postings(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<PostingRecord>> {
        let rows = sqlx::query(
            "SELECT id, user_id, amount, kind, reference_type, reference_id, note, created_at
             FROM trueque_postings WHERE user_id = $1
             ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(user.0)
        .bind(limit_bind(window))
        .bind(window.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(posting_from_row).collect()
    }

    async fn sum_postings(&self, user: UserId) -> StorageResult<Decimal> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS total
             FROM trueque_postings WHERE user_id = $1",
        )
        .bind(user.0)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        row.try_get("total").map_err(backend)
    }
}

const LISTING_COLUMNS: &str = "id, owner_user_id, title, description, value_true_coins, \
     image_url, latitude, longitude, is_published, is_available, created_at";

#[async_trait]
impl ListingStore for PostgresStorage {
    async fn create_listing(&self, listing: NewListing) -> StorageResult<ListingRecord> {
        let sql = format!(
            "INSERT INTO trueque_listings
                (owner_user_id, title, description, value_true_coins, image_url, latitude, longitude)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {LISTING_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(listing.owner_user_id.0)
            .bind(&listing.title)
            .bind(&listing.description)
            .bind(listing.value_true_coins)
            .bind(listing.image_url.as_deref())
            .bind(listing.latitude)
            .bind(listing.longitude)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_missing_parent(e, format!("user {} not found", listing.owner_user_id))
            })?;
        listing_from_row(&row)
    }

    async fn get_listing(&self, id: ListingId) -> StorageResult<Option<ListingRecord>> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM trueque_listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn update_listing(
        &self,
        id: ListingId,
        patch: ListingPatch,
    ) -> StorageResult<ListingRecord> {
        let sql = format!(
            "UPDATE trueque_listings SET
                title = COALESCE($2, title),
                description = COALESCE($3, description),
                value_true_coins = COALESCE($4, value_true_coins),
                image_url = COALESCE($5, image_url),
                is_published = COALESCE($6, is_published),
                is_available = COALESCE($7, is_available)
             WHERE id = $1
             RETURNING {LISTING_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(patch.title)
            .bind(patch.description)
            .bind(patch.value_true_coins)
            .bind(patch.image_url)
            .bind(patch.is_published)
            .bind(patch.is_available)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("listing {id} not found")))?;
        listing_from_row(&row)
    }

    async fn delete_listing(&self, id: ListingId) -> StorageResult<ListingRecord> {
        let sql = format!("DELETE FROM trueque_listings WHERE id = $1 RETURNING {LISTING_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("listing {id} not found")))?;
        listing_from_row(&row)
    }

    async fn catalog(
        &self,
        filter: CatalogFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<ListingRecord>> {
        let (lat, lng, radius) = match filter.near {
            Some(near) => (Some(near.latitude), Some(near.longitude), Some(near.radius_km)),
            None => (None, None, None),
        };
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM trueque_listings
             WHERE is_published AND is_available
               AND ($1::BIGINT IS NULL OR owner_user_id = $1)
               AND ($2::TEXT IS NULL
                    OR title ILIKE '%' || $2 || '%'
                    OR description ILIKE '%' || $2 || '%')
               AND ($3::NUMERIC IS NULL OR value_true_coins >= $3)
               AND ($4::NUMERIC IS NULL OR value_true_coins <= $4)
               AND ($5::DOUBLE PRECISION IS NULL OR (
                    latitude IS NOT NULL AND longitude IS NOT NULL
                    AND 2 * 6371 * asin(sqrt(
                        power(sin(radians(latitude - $5) / 2), 2)
                        + cos(radians($5)) * cos(radians(latitude))
                        * power(sin(radians(longitude - $6) / 2), 2)
                    )) <= $7
               ))
             ORDER BY id DESC LIMIT $8 OFFSET $9"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.owner.map(|o| o.0))
            .bind(filter.text)
            .bind(filter.min_value)
            .bind(filter.max_value)
            .bind(lat)
            .bind(lng)
            .bind(radius)
            .bind(limit_bind(window))
            .bind(window.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn listings_by_owner(&self, owner: UserId) -> StorageResult<Vec<ListingRecord>> {
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM trueque_listings
             WHERE owner_user_id = $1 ORDER BY id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.0)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(listing_from_row).collect()
    }
}

const TRADE_COLUMNS: &str = "id, requester_user_id, owner_user_id, target_listing_id, \
     offered_listing_id, offered_true_coins, requested_true_coins, status, message, \
     created_at, updated_at";

#[async_trait]
impl TradeStore for PostgresStorage {
    async fn create_trade(&self, trade: NewTrade) -> StorageResult<TradeRecord> {
        let sql = format!(
            "INSERT INTO trueque_trades
                (requester_user_id, owner_user_id, target_listing_id, offered_listing_id,
                 offered_true_coins, requested_true_coins, status, message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {TRADE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(trade.requester_user_id.0)
            .bind(trade.owner_user_id.0)
            .bind(trade.target_listing_id.0)
            .bind(trade.offered_listing_id.map(|l| l.0))
            .bind(trade.offered_true_coins)
            .bind(trade.requested_true_coins)
            .bind(trade_status_str(TradeStatus::Pending))
            .bind(trade.message.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        trade_from_row(&row)
    }

    async fn get_trade(&self, id: TradeId) -> StorageResult<Option<TradeRecord>> {
        let sql = format!("SELECT {TRADE_COLUMNS} FROM trueque_trades WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(trade_from_row).transpose()
    }

    async fn transition_trade(
        &self,
        id: TradeId,
        expected_from: TradeStatus,
        to: TradeStatus,
    ) -> StorageResult<TradeRecord> {
        let sql = format!(
            "UPDATE trueque_trades SET status = $3, updated_at = now()
             WHERE id = $1 AND status = $2
             RETURNING {TRADE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(trade_status_str(expected_from))
            .bind(trade_status_str(to))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => trade_from_row(&row),
            // Guard failed: distinguish a missing trade from a stale status.
            None => {
                let found = sqlx::query("SELECT status FROM trueque_trades WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?;
                match found {
                    Some(row) => {
                        let status: String = row.try_get("status").map_err(backend)?;
                        Err(StorageError::InvariantViolation(format!(
                            "invalid trade transition: expected {:?}, found {:?}",
                            expected_from,
                            parse_trade_status(&status)?
                        )))
                    }
                    None => Err(StorageError::NotFound(format!("trade {id} not found"))),
                }
            }
        }
    }

    async fn complete_trade(
        &self,
        id: TradeId,
        legs: Vec<PostingDraft>,
    ) -> StorageResult<TradeRecord> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query("SELECT status FROM trueque_trades WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("trade {id} not found")))?;
        let status: String = row.try_get("status").map_err(backend)?;
        let status = parse_trade_status(&status)?;
        if status != TradeStatus::Accepted {
            return Err(StorageError::InvariantViolation(format!(
                "invalid trade transition: expected Accepted, found {status:?}"
            )));
        }
        apply_postings_tx(&mut tx, &legs).await?;
        let sql = format!(
            "UPDATE trueque_trades SET status = $2, updated_at = now()
             WHERE id = $1 RETURNING {TRADE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(trade_status_str(TradeStatus::Completed))
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;
        let trade = trade_from_row(&row)?;
        tx.commit().await.map_err(backend)?;
        Ok(trade)
    }

    async fn trades_for_user(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<TradeRecord>> {
        let sql = format!(
            "SELECT {TRADE_COLUMNS} FROM trueque_trades
             WHERE requester_user_id = $1 OR owner_user_id = $1
             ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user.0)
            .bind(limit_bind(window))
            .bind(window.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn append_trade_message(
        &self,
        message: NewTradeMessage,
    ) -> StorageResult<TradeMessageRecord> {
        let row = sqlx::query(
            "INSERT INTO trueque_trade_messages (trade_id, sender_user_id, body)
             VALUES ($1, $2, $3)
             RETURNING id, trade_id, sender_user_id, body, created_at",
        )
        .bind(message.trade_id.0)
        .bind(message.sender_user_id.0)
        .bind(&message.body)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_missing_parent(e, format!("trade {} not found", message.trade_id)))?;
        trade_message_from_row(&row)
    }

    async fn list_trade_messages(
        &self,
        trade: TradeId,
    ) -> StorageResult<Vec<TradeMessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, trade_id, sender_user_id, body, created_at
             FROM trueque_trade_messages WHERE trade_id = $1 ORDER BY id ASC",
        )
        .bind(trade.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(trade_message_from_row).collect()
    }
}

const REWARD_COLUMNS: &str =
    "id, company_id, title, description, cost_true_coins, image_url, is_active, created_at";

const REDEMPTION_COLUMNS: &str =
    "id, reward_id, user_id, code, status, created_at, redeemed_at";

#[async_trait]
impl RewardStore for PostgresStorage {
    async fn create_reward(&self, reward: NewReward) -> StorageResult<RewardRecord> {
        let sql = format!(
            "INSERT INTO trueque_rewards
                (company_id, title, description, cost_true_coins, image_url)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {REWARD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(reward.company_id.0)
            .bind(&reward.title)
            .bind(reward.description.as_deref())
            .bind(reward.cost_true_coins)
            .bind(reward.image_url.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_missing_parent(e, format!("company {} not found", reward.company_id)))?;
        reward_from_row(&row)
    }

    async fn get_reward(&self, id: RewardId) -> StorageResult<Option<RewardRecord>> {
        let sql = format!("SELECT {REWARD_COLUMNS} FROM trueque_rewards WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(reward_from_row).transpose()
    }

    async fn set_reward_active(&self, id: RewardId, active: bool) -> StorageResult<RewardRecord> {
        let sql = format!(
            "UPDATE trueque_rewards SET is_active = $2 WHERE id = $1 RETURNING {REWARD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("reward {id} not found")))?;
        reward_from_row(&row)
    }

    async fn list_active_rewards(&self, window: QueryWindow) -> StorageResult<Vec<RewardRecord>> {
        let sql = format!(
            "SELECT {REWARD_COLUMNS} FROM trueque_rewards
             WHERE is_active ORDER BY id DESC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&sql)
            .bind(limit_bind(window))
            .bind(window.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(reward_from_row).collect()
    }

    async fn rewards_by_company(
        &self,
        company: CompanyId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RewardRecord>> {
        let sql = format!(
            "SELECT {REWARD_COLUMNS} FROM trueque_rewards
             WHERE company_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(company.0)
            .bind(limit_bind(window))
            .bind(window.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(reward_from_row).collect()
    }

    async fn create_redemption(
        &self,
        redemption: NewRedemption,
        debit: PostingDraft,
    ) -> StorageResult<RedemptionRecord> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        // Insert first so a code collision aborts before any user row lock.
        let sql = format!(
            "INSERT INTO trueque_redemptions (reward_id, user_id, code, status)
             VALUES ($1, $2, $3, $4)
             RETURNING {REDEMPTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(redemption.reward_id.0)
            .bind(redemption.user_id.0)
            .bind(&redemption.code)
            .bind(redemption_status_str(RedemptionStatus::Pending))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_conflict(e, &format!("voucher code {}", redemption.code)))?;
        let record = redemption_from_row(&row)?;
        apply_postings_tx(&mut tx, &[debit]).await?;
        tx.commit().await.map_err(backend)?;
        Ok(record)
    }

    async fn get_redemption(&self, id: RedemptionId) -> StorageResult<Option<RedemptionRecord>> {
        let sql = format!("SELECT {REDEMPTION_COLUMNS} FROM trueque_redemptions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(redemption_from_row).transpose()
    }

    async fn transition_redemption(
        &self,
        id: RedemptionId,
        expected_from: RedemptionStatus,
        to: RedemptionStatus,
    ) -> StorageResult<RedemptionRecord> {
        let sql = format!(
            "UPDATE trueque_redemptions
             SET status = $3,
                 redeemed_at = CASE WHEN $3 = 'redeemed' THEN now() ELSE redeemed_at END
             WHERE id = $1 AND status = $2
             RETURNING {REDEMPTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(redemption_status_str(expected_from))
            .bind(redemption_status_str(to))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => redemption_from_row(&row),
            None => {
                let found = sqlx::query("SELECT status FROM trueque_redemptions WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?;
                match found {
                    Some(row) => {
                        let status: String = row.try_get("status").map_err(backend)?;
                        Err(StorageError::InvariantViolation(format!(
                            "invalid redemption transition: expected {:?}, found {:?}",
                            expected_from,
                            parse_redemption_status(&status)?
                        )))
                    }
                    None => Err(StorageError::NotFound(format!("redemption {id} not found"))),
                }
            }
        }
    }

    async fn redemptions_by_user(
        &self,
        user: UserId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RedemptionRecord>> {
        let sql = format!(
            "SELECT {REDEMPTION_COLUMNS} FROM trueque_redemptions
             WHERE user_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user.0)
            .bind(limit_bind(window))
            .bind(window.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(redemption_from_row).collect()
    }

    async fn redemptions_by_company(
        &self,
        company: CompanyId,
        window: QueryWindow,
    ) -> StorageResult<Vec<RedemptionRecord>> {
        let rows = sqlx::query(
            "SELECT r.id, r.reward_id, r.user_id, r.code, r.status, r.created_at, r.redeemed_at
             FROM trueque_redemptions r
             JOIN trueque_rewards w ON w.id = r.reward_id
             WHERE w.company_id = $1
             ORDER BY r.id DESC LIMIT $2 OFFSET $3",
        )
        .bind(company.0)
        .bind(limit_bind(window))
        .bind(window.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(redemption_from_row).collect()
    }
}

const COMPANY_COLUMNS: &str = "id, name, description, phone, address, is_active, created_at";

#[async_trait]
impl CompanyStore for PostgresStorage {
    async fn create_company(&self, company: NewCompany) -> StorageResult<CompanyRecord> {
        let sql = format!(
            "INSERT INTO trueque_companies (name, description, phone, address)
             VALUES ($1, $2, $3, $4)
             RETURNING {COMPANY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&company.name)
            .bind(company.description.as_deref())
            .bind(company.phone.as_deref())
            .bind(company.address.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        company_from_row(&row)
    }

    async fn get_company(&self, id: CompanyId) -> StorageResult<Option<CompanyRecord>> {
        let sql = format!("SELECT {COMPANY_COLUMNS} FROM trueque_companies WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn update_company(
        &self,
        id: CompanyId,
        patch: CompanyPatch,
    ) -> StorageResult<CompanyRecord> {
        let sql = format!(
            "UPDATE trueque_companies SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                phone = COALESCE($4, phone),
                address = COALESCE($5, address),
                is_active = COALESCE($6, is_active)
             WHERE id = $1
             RETURNING {COMPANY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.0)
            .bind(patch.name)
            .bind(patch.description)
            .bind(patch.phone)
            .bind(patch.address)
            .bind(patch.is_active)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("company {id} not found")))?;
        company_from_row(&row)
    }

    async fn list_companies(&self, active_only: bool) -> StorageResult<Vec<CompanyRecord>> {
        let sql = format!(
            "SELECT {COMPANY_COLUMNS} FROM trueque_companies
             WHERE (NOT $1) OR is_active ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(company_from_row).collect()
    }
}

#[async_trait]
impl SettingStore for PostgresStorage {
    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<SettingRecord> {
        let row = sqlx::query(
            "INSERT INTO trueque_settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
             RETURNING key, value, updated_at",
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        setting_from_row(&row)
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<SettingRecord>> {
        let row = sqlx::query("SELECT key, value, updated_at FROM trueque_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(setting_from_row).transpose()
    }

    async fn delete_setting(&self, key: &str) -> StorageResult<()> {
        let result = sqlx::query("DELETE FROM trueque_settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("setting {key} not found")));
        }
        Ok(())
    }

    async fn list_settings(&self) -> StorageResult<Vec<SettingRecord>> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM trueque_settings ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(setting_from_row).collect()
    }
}
