//! Trade negotiation state machine.
//!
//! `Pending -> Accepted -> Completed`, with `Pending -> Rejected` and
//! `Pending/Accepted -> Cancelled` as alternate terminal transitions. Funds
//! move only on completion, inside one atomic unit with the status change.

use crate::auth::Identity;
use crate::{CoreError, CoreResult};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use trueque_storage::{
    ListingId, NewTrade, NewTradeMessage, PostingDraft, PostingKind, QueryWindow, ReferenceType,
    TradeId, TradeMessageRecord, TradeRecord, TradeStatus, TruequeStorage,
};

/// The full transition table. Everything not listed is rejected.
pub fn transition_allowed(from: TradeStatus, to: TradeStatus) -> bool {
    matches!(
        (from, to),
        (TradeStatus::Pending, TradeStatus::Accepted)
            | (TradeStatus::Pending, TradeStatus::Rejected)
            | (TradeStatus::Pending, TradeStatus::Cancelled)
            | (TradeStatus::Accepted, TradeStatus::Completed)
            | (TradeStatus::Accepted, TradeStatus::Cancelled)
    )
}

/// A new barter proposal from the requester's side.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeProposal {
    pub target_listing_id: ListingId,
    #[serde(default)]
    pub offered_listing_id: Option<ListingId>,
    #[serde(default)]
    pub offered_true_coins: Decimal,
    #[serde(default)]
    pub requested_true_coins: Decimal,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct TradeEngine {
    storage: Arc<dyn TruequeStorage>,
}

impl TradeEngine {
    pub fn new(storage: Arc<dyn TruequeStorage>) -> Self {
        Self { storage }
    }

    async fn load(&self, id: TradeId) -> CoreResult<TradeRecord> {
        self.storage
            .get_trade(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("trade {id} not found")))
    }

    pub async fn create(
        &self,
        caller: &Identity,
        proposal: TradeProposal,
    ) -> CoreResult<TradeRecord> {
        if proposal.offered_true_coins < Decimal::ZERO
            || proposal.requested_true_coins < Decimal::ZERO
        {
            return Err(CoreError::InvalidInput(
                "trade amounts must be non-negative".to_string(),
            ));
        }
        let target = self
            .storage
            .get_listing(proposal.target_listing_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "listing {} not found",
                    proposal.target_listing_id
                ))
            })?;
        if !target.is_published || !target.is_available {
            return Err(CoreError::InvalidInput(format!(
                "listing {} is not open for trade",
                target.id
            )));
        }
        if target.owner_user_id == caller.user_id {
            return Err(CoreError::InvalidInput(
                "cannot propose a trade for your own listing".to_string(),
            ));
        }
        if let Some(offered_id) = proposal.offered_listing_id {
            let offered = self
                .storage
                .get_listing(offered_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("listing {offered_id} not found")))?;
            if offered.owner_user_id != caller.user_id {
                return Err(CoreError::Forbidden(format!(
                    "offered listing {offered_id} is not owned by the caller"
                )));
            }
        }
        let trade = self
            .storage
            .create_trade(NewTrade {
                requester_user_id: caller.user_id,
                owner_user_id: target.owner_user_id,
                target_listing_id: target.id,
                offered_listing_id: proposal.offered_listing_id,
                offered_true_coins: proposal.offered_true_coins,
                requested_true_coins: proposal.requested_true_coins,
                message: proposal.message,
            })
            .await?;
        tracing::info!(
            trade = %trade.id,
            requester = %trade.requester_user_id,
            owner = %trade.owner_user_id,
            "trade proposed"
        );
        Ok(trade)
    }

    pub async fn get(&self, caller: &Identity, id: TradeId) -> CoreResult<TradeRecord> {
        let trade = self.load(id).await?;
        caller.require_participant(&trade)?;
        Ok(trade)
    }

    /// `Pending -> Accepted`, owner only. No funds move yet.
    pub async fn accept(&self, caller: &Identity, id: TradeId) -> CoreResult<TradeRecord> {
        self.update_status(caller, id, TradeStatus::Accepted).await
    }

    /// Move a trade to any status the transition table permits. Acceptance
    /// and rejection are the owner's call; completion and cancellation are
    /// open to either participant.
    pub async fn update_status(
        &self,
        caller: &Identity,
        id: TradeId,
        to: TradeStatus,
    ) -> CoreResult<TradeRecord> {
        let trade = self.load(id).await?;
        caller.require_participant(&trade)?;
        if matches!(to, TradeStatus::Accepted | TradeStatus::Rejected)
            && caller.user_id != trade.owner_user_id
        {
            return Err(CoreError::Forbidden(format!(
                "only the listing owner may move trade {id} to {to:?}"
            )));
        }
        if !transition_allowed(trade.status, to) {
            tracing::debug!(trade = %id, from = ?trade.status, to = ?to, "transition rejected");
            return Err(CoreError::InvalidTransition(format!(
                "cannot move trade {id} from {:?} to {to:?}",
                trade.status
            )));
        }
        let updated = if to == TradeStatus::Completed {
            self.complete(trade).await?
        } else {
            self.storage.transition_trade(id, trade.status, to).await?
        };
        tracing::info!(trade = %id, status = ?updated.status, "trade transitioned");
        Ok(updated)
    }

    /// Post the agreed transfers and mark the trade completed in one atomic
    /// unit. If any leg fails the trade stays `Accepted`, never half-applied.
    async fn complete(&self, trade: TradeRecord) -> CoreResult<TradeRecord> {
        let mut legs = Vec::new();
        if trade.offered_true_coins > Decimal::ZERO {
            legs.push(
                PostingDraft::new(
                    trade.requester_user_id,
                    -trade.offered_true_coins,
                    PostingKind::TradeTransferOut,
                    ReferenceType::Trade,
                )
                .with_reference(trade.id.0),
            );
            legs.push(
                PostingDraft::new(
                    trade.owner_user_id,
                    trade.offered_true_coins,
                    PostingKind::TradeTransferIn,
                    ReferenceType::Trade,
                )
                .with_reference(trade.id.0),
            );
        }
        if trade.requested_true_coins > Decimal::ZERO {
            legs.push(
                PostingDraft::new(
                    trade.owner_user_id,
                    -trade.requested_true_coins,
                    PostingKind::TradeTransferOut,
                    ReferenceType::Trade,
                )
                .with_reference(trade.id.0),
            );
            legs.push(
                PostingDraft::new(
                    trade.requester_user_id,
                    trade.requested_true_coins,
                    PostingKind::TradeTransferIn,
                    ReferenceType::Trade,
                )
                .with_reference(trade.id.0),
            );
        }
        Ok(self.storage.complete_trade(trade.id, legs).await?)
    }

    pub async fn my_trades(
        &self,
        caller: &Identity,
        window: QueryWindow,
    ) -> CoreResult<Vec<TradeRecord>> {
        Ok(self.storage.trades_for_user(caller.user_id, window).await?)
    }

    pub async fn send_message(
        &self,
        caller: &Identity,
        trade_id: TradeId,
        body: String,
    ) -> CoreResult<TradeMessageRecord> {
        let trade = self.load(trade_id).await?;
        caller.require_participant(&trade)?;
        if body.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "message body must not be empty".to_string(),
            ));
        }
        Ok(self
            .storage
            .append_trade_message(NewTradeMessage {
                trade_id,
                sender_user_id: caller.user_id,
                body,
            })
            .await?)
    }

    pub async fn list_messages(
        &self,
        caller: &Identity,
        trade_id: TradeId,
    ) -> CoreResult<Vec<TradeMessageRecord>> {
        let trade = self.load(trade_id).await?;
        caller.require_participant(&trade)?;
        Ok(self.storage.list_trade_messages(trade_id).await?)
    }
}
