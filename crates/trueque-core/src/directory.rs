//! User and company directory. Provisioning is admin-only; the public side
//! sees active companies and their profiles.

use crate::auth::Identity;
use crate::{CoreError, CoreResult};
use serde::Deserialize;
use std::sync::Arc;
use trueque_storage::{
    CompanyId, CompanyPatch, CompanyRecord, NewCompany, NewUser, Role, TruequeStorage, UserRecord,
};

#[derive(Debug, Clone, Deserialize)]
pub struct UserRequest {
    pub email: String,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
}

#[derive(Clone)]
pub struct Directory {
    storage: Arc<dyn TruequeStorage>,
}

impl Directory {
    pub fn new(storage: Arc<dyn TruequeStorage>) -> Self {
        Self { storage }
    }

    pub async fn create_user(
        &self,
        caller: &Identity,
        request: UserRequest,
    ) -> CoreResult<UserRecord> {
        caller.require_admin()?;
        if request.email.trim().is_empty() || !request.email.contains('@') {
            return Err(CoreError::InvalidInput(
                "a valid email address is required".to_string(),
            ));
        }
        if request.role == Role::Company {
            let company_id = request.company_id.ok_or_else(|| {
                CoreError::InvalidInput(
                    "a company operator requires a company_id".to_string(),
                )
            })?;
            if self.storage.get_company(company_id).await?.is_none() {
                return Err(CoreError::InvalidInput(format!(
                    "company {company_id} does not exist"
                )));
            }
        }
        let user = self
            .storage
            .create_user(NewUser {
                email: request.email,
                display_name: request.display_name,
                role: request.role,
                company_id: request.company_id,
            })
            .await?;
        tracing::info!(user = %user.id, role = ?user.role, "user provisioned");
        Ok(user)
    }

    pub async fn me(&self, caller: &Identity) -> CoreResult<UserRecord> {
        self.storage
            .get_user(caller.user_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("user {} not found", caller.user_id)))
    }

    pub async fn create_company(
        &self,
        caller: &Identity,
        company: NewCompany,
    ) -> CoreResult<CompanyRecord> {
        caller.require_admin()?;
        if company.name.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "company name must not be empty".to_string(),
            ));
        }
        let company = self.storage.create_company(company).await?;
        tracing::info!(company = %company.id, "company created");
        Ok(company)
    }

    pub async fn update_company(
        &self,
        caller: &Identity,
        id: CompanyId,
        patch: CompanyPatch,
    ) -> CoreResult<CompanyRecord> {
        caller.require_admin()?;
        Ok(self.storage.update_company(id, patch).await?)
    }

    pub async fn get_company(&self, id: CompanyId) -> CoreResult<CompanyRecord> {
        self.storage
            .get_company(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("company {id} not found")))
    }

    /// Public directory: active companies only.
    pub async fn companies(&self) -> CoreResult<Vec<CompanyRecord>> {
        Ok(self.storage.list_companies(true).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trueque_storage::{InMemoryStorage, UserId};

    fn admin() -> Identity {
        Identity::new(UserId(999), Role::Admin)
    }

    fn directory() -> Directory {
        Directory::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn provisioning_is_admin_only() {
        let directory = directory();
        let request = UserRequest {
            email: "a@example.com".to_string(),
            display_name: "a".to_string(),
            role: Role::User,
            company_id: None,
        };
        let denied = directory
            .create_user(&Identity::new(UserId(1), Role::User), request.clone())
            .await;
        assert!(matches!(denied, Err(CoreError::Forbidden(_))));

        directory.create_user(&admin(), request.clone()).await.unwrap();
        let duplicate = directory.create_user(&admin(), request).await;
        assert!(matches!(duplicate, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn company_operator_requires_an_existing_company() {
        let directory = directory();
        let orphan = directory
            .create_user(
                &admin(),
                UserRequest {
                    email: "op@example.com".to_string(),
                    display_name: "op".to_string(),
                    role: Role::Company,
                    company_id: Some(CompanyId(404)),
                },
            )
            .await;
        assert!(matches!(orphan, Err(CoreError::InvalidInput(_))));

        let company = directory
            .create_company(
                &admin(),
                NewCompany {
                    name: "cafe".to_string(),
                    description: None,
                    phone: None,
                    address: None,
                },
            )
            .await
            .unwrap();
        directory
            .create_user(
                &admin(),
                UserRequest {
                    email: "op@example.com".to_string(),
                    display_name: "op".to_string(),
                    role: Role::Company,
                    company_id: Some(company.id),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn public_directory_hides_inactive_companies() {
        let directory = directory();
        let open = directory
            .create_company(
                &admin(),
                NewCompany {
                    name: "open".to_string(),
                    description: None,
                    phone: None,
                    address: None,
                },
            )
            .await
            .unwrap();
        let closed = directory
            .create_company(
                &admin(),
                NewCompany {
                    name: "closed".to_string(),
                    description: None,
                    phone: None,
                    address: None,
                },
            )
            .await
            .unwrap();
        directory
            .update_company(
                &admin(),
                closed.id,
                CompanyPatch {
                    is_active: Some(false),
                    ..CompanyPatch::default()
                },
            )
            .await
            .unwrap();

        let listed = directory.companies().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, open.id);
        // Inactive companies remain individually fetchable.
        directory.get_company(closed.id).await.unwrap();
    }
}
