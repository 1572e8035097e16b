#![deny(unsafe_code)]

pub mod handlers;
pub mod identity;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use trueque_adapters::{BinanceP2P, LocalMediaStore, BINANCE_P2P_ENDPOINT};
use trueque_core::connectors::{MediaStore, PriceSource};
use trueque_core::directory::Directory;
use trueque_core::ledger::Ledger;
use trueque_core::listings::Listings;
use trueque_core::rewards::RedemptionManager;
use trueque_core::settings::Settings;
use trueque_core::trades::TradeEngine;
use trueque_core::CoreError;
use trueque_storage::{StorageConfig, StorageError, TruequeStorage};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub media_root: PathBuf,
    pub media_base_url: String,
    pub p2p_endpoint: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            media_root: PathBuf::from("./media"),
            media_base_url: "/media".to_string(),
            p2p_endpoint: BINANCE_P2P_ENDPOINT.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub storage: Arc<dyn TruequeStorage>,
    pub ledger: Ledger,
    pub trades: TradeEngine,
    pub listings: Listings,
    pub redemptions: RedemptionManager,
    pub directory: Directory,
    pub settings: Settings,
    pub media: Arc<dyn MediaStore>,
    pub prices: Arc<dyn PriceSource>,
    pub storage_label: &'static str,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, StorageError> {
        let storage = trueque_storage::open(&config.storage).await?;
        let media: Arc<dyn MediaStore> = Arc::new(LocalMediaStore::new(
            config.media_root,
            config.media_base_url,
        ));
        let prices: Arc<dyn PriceSource> = Arc::new(BinanceP2P::new(config.p2p_endpoint));
        Ok(Self::with_connectors(
            storage,
            media,
            prices,
            config.storage.label(),
        ))
    }

    /// Wire the domain services over explicit connectors. Tests use this to
    /// swap in doubles.
    pub fn with_connectors(
        storage: Arc<dyn TruequeStorage>,
        media: Arc<dyn MediaStore>,
        prices: Arc<dyn PriceSource>,
        storage_label: &'static str,
    ) -> Self {
        Self {
            ledger: Ledger::new(Arc::clone(&storage)),
            trades: TradeEngine::new(Arc::clone(&storage)),
            listings: Listings::new(Arc::clone(&storage), Arc::clone(&media)),
            redemptions: RedemptionManager::new(Arc::clone(&storage)),
            directory: Directory::new(Arc::clone(&storage)),
            settings: Settings::new(Arc::clone(&storage)),
            storage,
            media,
            prices,
            storage_label,
        }
    }
}

/// Error surfaced to HTTP callers: a status code, a stable machine-readable
/// kind and a human-readable message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized",
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_input",
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::InsufficientFunds(_) | CoreError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            CoreError::InvalidTransition(_) | CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Unavailable(_) => StatusCode::BAD_GATEWAY,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "kind": self.kind, "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "trueque-service",
        storage_backend: state.storage_label,
    })
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/users/me", get(handlers::me))
        .route("/api/users", post(handlers::create_user))
        .route("/api/wallet", get(handlers::wallet))
        .route("/api/wallet/adjust", post(handlers::adjust_wallet))
        .route("/api/wallet/audit/:user_id", get(handlers::audit_wallet))
        .route(
            "/api/listings",
            get(handlers::catalog).post(handlers::create_listing),
        )
        .route("/api/listings/mine", get(handlers::my_listings))
        .route(
            "/api/listings/:id",
            get(handlers::get_listing)
                .put(handlers::update_listing)
                .delete(handlers::delete_listing),
        )
        .route("/api/media", post(handlers::upload_media))
        .route("/api/trades", post(handlers::create_trade))
        .route("/api/trades/my", get(handlers::my_trades))
        .route("/api/trades/:id", get(handlers::get_trade))
        .route("/api/trades/:id/accept", post(handlers::accept_trade))
        .route("/api/trades/:id/status", put(handlers::update_trade_status))
        .route(
            "/api/trades/:id/messages",
            get(handlers::list_trade_messages).post(handlers::send_trade_message),
        )
        .route(
            "/api/rewards",
            get(handlers::reward_catalog).post(handlers::create_reward),
        )
        .route("/api/rewards/company", get(handlers::company_rewards))
        .route("/api/rewards/:id/active", put(handlers::set_reward_active))
        .route("/api/rewards/:id/redeem", post(handlers::redeem_reward))
        .route("/api/redemptions/my", get(handlers::my_redemptions))
        .route(
            "/api/redemptions/company",
            get(handlers::company_redemptions),
        )
        .route(
            "/api/redemptions/:id/status",
            put(handlers::update_redemption_status),
        )
        .route(
            "/api/companies",
            get(handlers::list_companies).post(handlers::create_company),
        )
        .route(
            "/api/companies/:id",
            get(handlers::get_company).put(handlers::update_company),
        )
        .route("/api/settings", get(handlers::list_settings))
        .route(
            "/api/settings/:key",
            get(handlers::get_setting)
                .put(handlers::put_setting)
                .delete(handlers::delete_setting),
        )
        .route("/api/market/usdt-bob", get(handlers::usdt_bob))
        .with_state(state)
}
