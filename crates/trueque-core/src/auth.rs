//! Authorization checks applied at the entry of each core operation.
//!
//! The identity pair arrives already verified by the upstream gateway; the
//! core trusts it and only decides what the caller may do. No handler does
//! ad hoc role comparisons.

use crate::{CoreError, CoreResult};
use trueque_storage::{Role, TradeRecord, UserId};

/// Verified caller identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> CoreResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(CoreError::Forbidden("admin role required".to_string()))
        }
    }

    /// Company operators and admins pass; everybody else is rejected.
    pub fn require_company_or_admin(&self) -> CoreResult<()> {
        match self.role {
            Role::Company | Role::Admin => Ok(()),
            Role::User => Err(CoreError::Forbidden(
                "company or admin role required".to_string(),
            )),
        }
    }

    /// Only the two parties of a trade may act on it.
    pub fn require_participant(&self, trade: &TradeRecord) -> CoreResult<()> {
        if trade.is_participant(self.user_id) {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "user {} is not a participant of trade {}",
                self.user_id, trade.id
            )))
        }
    }

    /// The owning user passes, and so does an admin.
    pub fn require_owner_or_admin(&self, owner: UserId) -> CoreResult<()> {
        if self.user_id == owner || self.is_admin() {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "user {} does not own this resource",
                self.user_id
            )))
        }
    }
}
