use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Identifier of a user account.
    UserId
);
id_type!(
    /// Identifier of a ledger posting.
    PostingId
);
id_type!(
    /// Identifier of a listing.
    ListingId
);
id_type!(
    /// Identifier of a trade negotiation.
    TradeId
);
id_type!(
    /// Identifier of a trade message.
    TradeMessageId
);
id_type!(
    /// Identifier of a reward catalog entry.
    RewardId
);
id_type!(
    /// Identifier of a reward redemption.
    RedemptionId
);
id_type!(
    /// Identifier of a company.
    CompanyId
);

/// Role carried by a verified identity and persisted on the user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Company,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "user" => Ok(Role::User),
            "company" => Ok(Role::Company),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

/// Cause of a balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingKind {
    RewardSpend,
    AdminAdjustment,
    TradeTransferIn,
    TradeTransferOut,
}

/// Entity a posting references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Trade,
    Reward,
    Admin,
}

/// Trade negotiation status. `Pending` is initial; `Completed`, `Rejected`,
/// and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Accepted,
    Completed,
    Rejected,
    Cancelled,
}

/// Redemption status. Terminal once `Redeemed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    Redeemed,
    Cancelled,
}

/// Persistent user account. `balance` is a cached aggregate owned by the
/// ledger; it always equals the sum of the user's postings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub company_id: Option<CompanyId>,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub company_id: Option<CompanyId>,
}

/// Immutable ledger posting. Never updated or deleted; corrections are new
/// offsetting postings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingRecord {
    pub id: PostingId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: PostingKind,
    pub reference_type: ReferenceType,
    pub reference_id: Option<i64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One leg of an atomic ledger append. Id and timestamp are assigned by the
/// storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingDraft {
    pub user_id: UserId,
    pub amount: Decimal,
    pub kind: PostingKind,
    pub reference_type: ReferenceType,
    pub reference_id: Option<i64>,
    pub note: Option<String>,
}

impl PostingDraft {
    pub fn new(
        user_id: UserId,
        amount: Decimal,
        kind: PostingKind,
        reference_type: ReferenceType,
    ) -> Self {
        Self {
            user_id,
            amount,
            kind,
            reference_type,
            reference_id: None,
            note: None,
        }
    }

    pub fn with_reference(mut self, reference_id: i64) -> Self {
        self.reference_id = Some(reference_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Admin adjustments may drive a balance negative; every other debit is
    /// checked against the current balance inside the engine's transaction.
    pub fn bypasses_sufficiency(&self) -> bool {
        self.kind == PostingKind::AdminAdjustment
    }
}

/// Persistent listing. The public catalog shows only published and
/// available listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: ListingId,
    pub owner_user_id: UserId,
    pub title: String,
    pub description: String,
    pub value_true_coins: Decimal,
    pub image_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_published: bool,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewListing {
    pub owner_user_id: UserId,
    pub title: String,
    pub description: String,
    pub value_true_coins: Decimal,
    pub image_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Partial listing update; `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListingPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub value_true_coins: Option<Decimal>,
    pub image_url: Option<String>,
    pub is_published: Option<bool>,
    pub is_available: Option<bool>,
}

/// Proximity filter for catalog queries. Distance is computed by the
/// storage engine with the haversine formula.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoFilter {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: f64,
}

/// Catalog query over published, available listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFilter {
    pub owner: Option<UserId>,
    pub text: Option<String>,
    pub min_value: Option<Decimal>,
    pub max_value: Option<Decimal>,
    pub near: Option<GeoFilter>,
}

/// Persistent trade negotiation between a requester and a listing owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub requester_user_id: UserId,
    pub owner_user_id: UserId,
    pub target_listing_id: ListingId,
    pub offered_listing_id: Option<ListingId>,
    pub offered_true_coins: Decimal,
    pub requested_true_coins: Decimal,
    pub status: TradeStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn is_participant(&self, user: UserId) -> bool {
        self.requester_user_id == user || self.owner_user_id == user
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrade {
    pub requester_user_id: UserId,
    pub owner_user_id: UserId,
    pub target_listing_id: ListingId,
    pub offered_listing_id: Option<ListingId>,
    pub offered_true_coins: Decimal,
    pub requested_true_coins: Decimal,
    pub message: Option<String>,
}

/// Immutable message in a trade conversation, ordered by creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeMessageRecord {
    pub id: TradeMessageId,
    pub trade_id: TradeId,
    pub sender_user_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTradeMessage {
    pub trade_id: TradeId,
    pub sender_user_id: UserId,
    pub body: String,
}

/// Reward catalog entry owned by a company. Deactivation hides it from the
/// public catalog without deleting history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRecord {
    pub id: RewardId,
    pub company_id: CompanyId,
    pub title: String,
    pub description: Option<String>,
    pub cost_true_coins: Decimal,
    pub image_url: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReward {
    pub company_id: CompanyId,
    pub title: String,
    pub description: Option<String>,
    pub cost_true_coins: Decimal,
    pub image_url: Option<String>,
}

/// A user's claim on one reward, identified by a globally unique voucher
/// code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub id: RedemptionId,
    pub reward_id: RewardId,
    pub user_id: UserId,
    pub code: String,
    pub status: RedemptionStatus,
    pub created_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRedemption {
    pub reward_id: RewardId,
    pub user_id: UserId,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: CompanyId,
    pub name: String,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCompany {
    pub name: String,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Partial company update; `None` keeps the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub is_active: Option<bool>,
}

/// Admin-managed key/value setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingRecord {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
