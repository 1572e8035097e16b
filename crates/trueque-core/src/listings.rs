//! Listings and the public catalog.
//!
//! Record mutations are transactional in the storage engine; cleanup of a
//! replaced or orphaned image is a decoupled best-effort side effect that
//! never rolls back a committed change and never reaches the caller.

use crate::auth::Identity;
use crate::connectors::MediaStore;
use crate::{CoreError, CoreResult};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use trueque_storage::{
    CatalogFilter, ListingId, ListingPatch, ListingRecord, NewListing, QueryWindow,
    TruequeStorage,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ListingRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub value_true_coins: Decimal,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Clone)]
pub struct Listings {
    storage: Arc<dyn TruequeStorage>,
    media: Arc<dyn MediaStore>,
}

impl Listings {
    pub fn new(storage: Arc<dyn TruequeStorage>, media: Arc<dyn MediaStore>) -> Self {
        Self { storage, media }
    }

    async fn load(&self, id: ListingId) -> CoreResult<ListingRecord> {
        self.storage
            .get_listing(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("listing {id} not found")))
    }

    pub async fn create(
        &self,
        caller: &Identity,
        request: ListingRequest,
    ) -> CoreResult<ListingRecord> {
        if request.title.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "listing title must not be empty".to_string(),
            ));
        }
        if request.value_true_coins < Decimal::ZERO {
            return Err(CoreError::InvalidInput(
                "listing value must be non-negative".to_string(),
            ));
        }
        let listing = self
            .storage
            .create_listing(NewListing {
                owner_user_id: caller.user_id,
                title: request.title,
                description: request.description,
                value_true_coins: request.value_true_coins,
                image_url: request.image_url,
                latitude: request.latitude,
                longitude: request.longitude,
            })
            .await?;
        tracing::info!(listing = %listing.id, owner = %caller.user_id, "listing created");
        Ok(listing)
    }

    pub async fn update(
        &self,
        caller: &Identity,
        id: ListingId,
        patch: ListingPatch,
    ) -> CoreResult<ListingRecord> {
        let current = self.load(id).await?;
        caller.require_owner_or_admin(current.owner_user_id)?;
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(CoreError::InvalidInput(
                    "listing title must not be empty".to_string(),
                ));
            }
        }
        if let Some(value) = patch.value_true_coins {
            if value < Decimal::ZERO {
                return Err(CoreError::InvalidInput(
                    "listing value must be non-negative".to_string(),
                ));
            }
        }
        let replaces_image =
            patch.image_url.is_some() && patch.image_url != current.image_url;
        let updated = self.storage.update_listing(id, patch).await?;
        if replaces_image {
            if let Some(old) = current.image_url {
                self.cleanup_media(old);
            }
        }
        Ok(updated)
    }

    pub async fn delete(&self, caller: &Identity, id: ListingId) -> CoreResult<ListingRecord> {
        let current = self.load(id).await?;
        caller.require_owner_or_admin(current.owner_user_id)?;
        let deleted = self.storage.delete_listing(id).await?;
        tracing::info!(listing = %id, "listing deleted");
        if let Some(url) = deleted.image_url.clone() {
            self.cleanup_media(url);
        }
        Ok(deleted)
    }

    pub async fn get(&self, id: ListingId) -> CoreResult<ListingRecord> {
        self.load(id).await
    }

    pub async fn catalog(
        &self,
        filter: CatalogFilter,
        window: QueryWindow,
    ) -> CoreResult<Vec<ListingRecord>> {
        Ok(self.storage.catalog(filter, window).await?)
    }

    pub async fn mine(&self, caller: &Identity) -> CoreResult<Vec<ListingRecord>> {
        Ok(self.storage.listings_by_owner(caller.user_id).await?)
    }

    fn cleanup_media(&self, url: String) {
        let media = Arc::clone(&self.media);
        tokio::spawn(async move {
            if let Err(err) = media.delete(&url).await {
                tracing::warn!(url = %url, error = %err, "orphaned media object not deleted");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use trueque_storage::{InMemoryStorage, NewUser, Role, UserId, UserStore};

    #[derive(Default)]
    struct RecordingMedia {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaStore for RecordingMedia {
        async fn put(&self, key: &str, _bytes: Vec<u8>, _content_type: &str) -> CoreResult<String> {
            Ok(format!("/media/{key}"))
        }

        async fn delete(&self, url: &str) -> CoreResult<()> {
            self.deleted.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    async fn fixture() -> (Listings, Arc<RecordingMedia>, Identity) {
        let storage = Arc::new(InMemoryStorage::new());
        let user = storage
            .create_user(NewUser {
                email: "a@example.com".to_string(),
                display_name: "a".to_string(),
                role: Role::User,
                company_id: None,
            })
            .await
            .unwrap();
        let media = Arc::new(RecordingMedia::default());
        let listings = Listings::new(storage, Arc::clone(&media) as Arc<dyn MediaStore>);
        (listings, media, Identity::new(user.id, Role::User))
    }

    fn request(title: &str) -> ListingRequest {
        ListingRequest {
            title: title.to_string(),
            description: String::new(),
            value_true_coins: dec!(10),
            image_url: None,
            latitude: None,
            longitude: None,
        }
    }

    #[tokio::test]
    async fn create_validates_title_and_value() {
        let (listings, _, owner) = fixture().await;

        let blank = listings.create(&owner, request("  ")).await;
        assert!(matches!(blank, Err(CoreError::InvalidInput(_))));

        let negative = listings
            .create(
                &owner,
                ListingRequest {
                    value_true_coins: dec!(-1),
                    ..request("couch")
                },
            )
            .await;
        assert!(matches!(negative, Err(CoreError::InvalidInput(_))));

        let ok = listings.create(&owner, request("couch")).await.unwrap();
        assert!(ok.is_published);
        assert!(ok.is_available);
    }

    #[tokio::test]
    async fn update_and_delete_are_owner_gated() {
        let (listings, _, owner) = fixture().await;
        let listing = listings.create(&owner, request("couch")).await.unwrap();

        let stranger = Identity::new(UserId(404), Role::User);
        let denied = listings
            .update(
                &stranger,
                listing.id,
                ListingPatch {
                    title: Some("mine now".to_string()),
                    ..ListingPatch::default()
                },
            )
            .await;
        assert!(matches!(denied, Err(CoreError::Forbidden(_))));

        let admin = Identity::new(UserId(999), Role::Admin);
        let by_admin = listings
            .update(
                &admin,
                listing.id,
                ListingPatch {
                    is_published: Some(false),
                    ..ListingPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(!by_admin.is_published);

        listings.delete(&owner, listing.id).await.unwrap();
        let gone = listings.get(listing.id).await;
        assert!(matches!(gone, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn deleting_a_listing_cleans_up_its_image() {
        let (listings, media, owner) = fixture().await;
        let listing = listings
            .create(
                &owner,
                ListingRequest {
                    image_url: Some("/media/old.jpg".to_string()),
                    ..request("couch")
                },
            )
            .await
            .unwrap();

        listings.delete(&owner, listing.id).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            media.deleted.lock().unwrap().as_slice(),
            ["/media/old.jpg"]
        );
    }

    #[tokio::test]
    async fn replacing_an_image_cleans_up_the_old_one() {
        let (listings, media, owner) = fixture().await;
        let listing = listings
            .create(
                &owner,
                ListingRequest {
                    image_url: Some("/media/old.jpg".to_string()),
                    ..request("couch")
                },
            )
            .await
            .unwrap();

        listings
            .update(
                &owner,
                listing.id,
                ListingPatch {
                    image_url: Some("/media/new.jpg".to_string()),
                    ..ListingPatch::default()
                },
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            media.deleted.lock().unwrap().as_slice(),
            ["/media/old.jpg"]
        );
    }
}
