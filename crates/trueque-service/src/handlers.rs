//! Route handlers. Each one extracts the caller identity where the route
//! requires it, then delegates to a single core service call; authorization
//! lives in the core, not here.

use crate::identity::AuthIdentity;
use crate::{ApiError, ServiceState};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use trueque_core::directory::UserRequest;
use trueque_core::ledger::{LedgerAudit, WalletSummary};
use trueque_core::listings::ListingRequest;
use trueque_core::rewards::RewardRequest;
use trueque_core::trades::TradeProposal;
use trueque_storage::{
    CatalogFilter, CompanyId, CompanyPatch, CompanyRecord, GeoFilter, ListingId, ListingPatch,
    ListingRecord, NewCompany, PostingRecord, QueryWindow, RedemptionId, RedemptionRecord,
    RedemptionStatus, RewardId, RewardRecord, SettingRecord, TradeId, TradeMessageRecord,
    TradeRecord, TradeStatus, UserId, UserRecord,
};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

impl WindowQuery {
    fn window(&self) -> QueryWindow {
        QueryWindow {
            limit: self.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE),
            offset: self.offset.unwrap_or(0),
        }
    }
}

// Users

pub async fn me(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
) -> Result<Json<UserRecord>, ApiError> {
    Ok(Json(state.directory.me(&caller).await?))
}

pub async fn create_user(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Json(request): Json<UserRequest>,
) -> Result<Json<UserRecord>, ApiError> {
    Ok(Json(state.directory.create_user(&caller, request).await?))
}

// Wallet

pub async fn wallet(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
) -> Result<Json<WalletSummary>, ApiError> {
    Ok(Json(state.ledger.wallet_summary(caller.user_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdjustRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub reason: String,
}

pub async fn adjust_wallet(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<PostingRecord>, ApiError> {
    Ok(Json(
        state
            .ledger
            .admin_adjust(&caller, request.user_id, request.amount, &request.reason)
            .await?,
    ))
}

pub async fn audit_wallet(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(user_id): Path<i64>,
) -> Result<Json<LedgerAudit>, ApiError> {
    Ok(Json(
        state.ledger.audit_user(&caller, UserId(user_id)).await?,
    ))
}

// Listings

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogQuery {
    owner: Option<i64>,
    q: Option<String>,
    min_value: Option<Decimal>,
    max_value: Option<Decimal>,
    lat: Option<f64>,
    lng: Option<f64>,
    radius_km: Option<f64>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl CatalogQuery {
    fn filter(&self) -> Result<CatalogFilter, ApiError> {
        let near = match (self.lat, self.lng, self.radius_km) {
            (Some(latitude), Some(longitude), Some(radius_km)) => Some(GeoFilter {
                latitude,
                longitude,
                radius_km,
            }),
            (None, None, None) => None,
            _ => {
                return Err(ApiError::bad_request(
                    "a proximity filter requires lat, lng and radius_km together",
                ))
            }
        };
        Ok(CatalogFilter {
            owner: self.owner.map(UserId),
            text: self.q.clone(),
            min_value: self.min_value,
            max_value: self.max_value,
            near,
        })
    }

    fn window(&self) -> QueryWindow {
        QueryWindow {
            limit: self.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE),
            offset: self.offset.unwrap_or(0),
        }
    }
}

pub async fn catalog(
    State(state): State<ServiceState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<ListingRecord>>, ApiError> {
    let filter = query.filter()?;
    Ok(Json(state.listings.catalog(filter, query.window()).await?))
}

pub async fn my_listings(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
) -> Result<Json<Vec<ListingRecord>>, ApiError> {
    Ok(Json(state.listings.mine(&caller).await?))
}

pub async fn get_listing(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<ListingRecord>, ApiError> {
    Ok(Json(state.listings.get(ListingId(id)).await?))
}

pub async fn create_listing(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Json(request): Json<ListingRequest>,
) -> Result<Json<ListingRecord>, ApiError> {
    Ok(Json(state.listings.create(&caller, request).await?))
}

pub async fn update_listing(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
    Json(patch): Json<ListingPatch>,
) -> Result<Json<ListingRecord>, ApiError> {
    Ok(Json(
        state.listings.update(&caller, ListingId(id), patch).await?,
    ))
}

pub async fn delete_listing(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
) -> Result<Json<ListingRecord>, ApiError> {
    Ok(Json(state.listings.delete(&caller, ListingId(id)).await?))
}

// Media

pub const FILE_NAME_HEADER: &str = "x-file-name";

#[derive(Debug, Clone, Serialize)]
pub struct MediaResponse {
    pub url: String,
}

pub async fn upload_media(
    State(state): State<ServiceState>,
    AuthIdentity(_caller): AuthIdentity,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MediaResponse>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::bad_request("media upload body is empty"));
    }
    let name = headers
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("upload");
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let url = state.media.put(name, body.to_vec(), content_type).await?;
    Ok(Json(MediaResponse { url }))
}

// Trades

pub async fn create_trade(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Json(proposal): Json<TradeProposal>,
) -> Result<Json<TradeRecord>, ApiError> {
    Ok(Json(state.trades.create(&caller, proposal).await?))
}

pub async fn my_trades(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<TradeRecord>>, ApiError> {
    Ok(Json(state.trades.my_trades(&caller, query.window()).await?))
}

pub async fn get_trade(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
) -> Result<Json<TradeRecord>, ApiError> {
    Ok(Json(state.trades.get(&caller, TradeId(id)).await?))
}

pub async fn accept_trade(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
) -> Result<Json<TradeRecord>, ApiError> {
    Ok(Json(state.trades.accept(&caller, TradeId(id)).await?))
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeStatusRequest {
    pub status: TradeStatus,
}

pub async fn update_trade_status(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
    Json(request): Json<TradeStatusRequest>,
) -> Result<Json<TradeRecord>, ApiError> {
    Ok(Json(
        state
            .trades
            .update_status(&caller, TradeId(id), request.status)
            .await?,
    ))
}

pub async fn list_trade_messages(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
) -> Result<Json<Vec<TradeMessageRecord>>, ApiError> {
    Ok(Json(state.trades.list_messages(&caller, TradeId(id)).await?))
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessageRequest {
    pub body: String,
}

pub async fn send_trade_message(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
    Json(request): Json<TradeMessageRequest>,
) -> Result<Json<TradeMessageRecord>, ApiError> {
    Ok(Json(
        state
            .trades
            .send_message(&caller, TradeId(id), request.body)
            .await?,
    ))
}

// Rewards & redemptions

pub async fn reward_catalog(
    State(state): State<ServiceState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<RewardRecord>>, ApiError> {
    Ok(Json(state.redemptions.catalog(query.window()).await?))
}

pub async fn create_reward(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Json(request): Json<RewardRequest>,
) -> Result<Json<RewardRecord>, ApiError> {
    Ok(Json(state.redemptions.create_reward(&caller, request).await?))
}

pub async fn company_rewards(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<RewardRecord>>, ApiError> {
    Ok(Json(
        state
            .redemptions
            .company_rewards(&caller, query.window())
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardActiveRequest {
    pub active: bool,
}

pub async fn set_reward_active(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
    Json(request): Json<RewardActiveRequest>,
) -> Result<Json<RewardRecord>, ApiError> {
    Ok(Json(
        state
            .redemptions
            .set_reward_active(&caller, RewardId(id), request.active)
            .await?,
    ))
}

pub async fn redeem_reward(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
) -> Result<Json<RedemptionRecord>, ApiError> {
    Ok(Json(state.redemptions.redeem(&caller, RewardId(id)).await?))
}

pub async fn my_redemptions(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<RedemptionRecord>>, ApiError> {
    Ok(Json(
        state
            .redemptions
            .my_redemptions(&caller, query.window())
            .await?,
    ))
}

pub async fn company_redemptions(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<RedemptionRecord>>, ApiError> {
    Ok(Json(
        state
            .redemptions
            .company_redemptions(&caller, query.window())
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedemptionStatusRequest {
    pub status: RedemptionStatus,
}

pub async fn update_redemption_status(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
    Json(request): Json<RedemptionStatusRequest>,
) -> Result<Json<RedemptionRecord>, ApiError> {
    Ok(Json(
        state
            .redemptions
            .update_status(&caller, RedemptionId(id), request.status)
            .await?,
    ))
}

// Companies

pub async fn list_companies(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<CompanyRecord>>, ApiError> {
    Ok(Json(state.directory.companies().await?))
}

pub async fn get_company(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<CompanyRecord>, ApiError> {
    Ok(Json(state.directory.get_company(CompanyId(id)).await?))
}

pub async fn create_company(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Json(company): Json<NewCompany>,
) -> Result<Json<CompanyRecord>, ApiError> {
    Ok(Json(state.directory.create_company(&caller, company).await?))
}

pub async fn update_company(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(id): Path<i64>,
    Json(patch): Json<CompanyPatch>,
) -> Result<Json<CompanyRecord>, ApiError> {
    Ok(Json(
        state
            .directory
            .update_company(&caller, CompanyId(id), patch)
            .await?,
    ))
}

// Settings

pub async fn list_settings(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
) -> Result<Json<Vec<SettingRecord>>, ApiError> {
    Ok(Json(state.settings.list(&caller).await?))
}

pub async fn get_setting(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(key): Path<String>,
) -> Result<Json<SettingRecord>, ApiError> {
    Ok(Json(state.settings.get(&caller, &key).await?))
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingRequest {
    pub value: String,
}

pub async fn put_setting(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(key): Path<String>,
    Json(request): Json<SettingRequest>,
) -> Result<Json<SettingRecord>, ApiError> {
    Ok(Json(state.settings.put(&caller, &key, &request.value).await?))
}

pub async fn delete_setting(
    State(state): State<ServiceState>,
    AuthIdentity(caller): AuthIdentity,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.settings.delete(&caller, &key).await?;
    Ok(Json(serde_json::json!({ "deleted": key })))
}

// Market

#[derive(Debug, Clone, Serialize)]
pub struct PriceResponse {
    pub pair: &'static str,
    pub price: Decimal,
}

pub async fn usdt_bob(
    State(state): State<ServiceState>,
) -> Result<Json<PriceResponse>, ApiError> {
    let price = state.prices.usdt_bob().await?;
    Ok(Json(PriceResponse {
        pair: "USDT/BOB",
        price,
    }))
}
