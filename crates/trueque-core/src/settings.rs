//! Admin-managed key/value settings.

use crate::auth::Identity;
use crate::{CoreError, CoreResult};
use std::sync::Arc;
use trueque_storage::{SettingRecord, TruequeStorage};

#[derive(Clone)]
pub struct Settings {
    storage: Arc<dyn TruequeStorage>,
}

impl Settings {
    pub fn new(storage: Arc<dyn TruequeStorage>) -> Self {
        Self { storage }
    }

    pub async fn put(
        &self,
        caller: &Identity,
        key: &str,
        value: &str,
    ) -> CoreResult<SettingRecord> {
        caller.require_admin()?;
        if key.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "setting key must not be empty".to_string(),
            ));
        }
        let setting = self.storage.put_setting(key, value).await?;
        tracing::info!(key = %key, "setting updated");
        Ok(setting)
    }

    pub async fn get(&self, caller: &Identity, key: &str) -> CoreResult<SettingRecord> {
        caller.require_admin()?;
        self.storage
            .get_setting(key)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("setting {key} not found")))
    }

    pub async fn delete(&self, caller: &Identity, key: &str) -> CoreResult<()> {
        caller.require_admin()?;
        self.storage.delete_setting(key).await?;
        tracing::info!(key = %key, "setting deleted");
        Ok(())
    }

    pub async fn list(&self, caller: &Identity) -> CoreResult<Vec<SettingRecord>> {
        caller.require_admin()?;
        Ok(self.storage.list_settings().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trueque_storage::{InMemoryStorage, Role, UserId};

    fn admin() -> Identity {
        Identity::new(UserId(999), Role::Admin)
    }

    #[tokio::test]
    async fn settings_are_admin_only_and_upsert() {
        let settings = Settings::new(Arc::new(InMemoryStorage::new()));

        let denied = settings
            .put(&Identity::new(UserId(1), Role::User), "motd", "hi")
            .await;
        assert!(matches!(denied, Err(CoreError::Forbidden(_))));

        settings.put(&admin(), "motd", "hi").await.unwrap();
        settings.put(&admin(), "motd", "bye").await.unwrap();
        assert_eq!(settings.get(&admin(), "motd").await.unwrap().value, "bye");
        assert_eq!(settings.list(&admin()).await.unwrap().len(), 1);

        settings.delete(&admin(), "motd").await.unwrap();
        let missing = settings.delete(&admin(), "motd").await;
        assert!(matches!(missing, Err(CoreError::NotFound(_))));
    }
}
