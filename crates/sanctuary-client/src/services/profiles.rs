//! User profiles and the records listed on a profile page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use sanctuary_backend::{Direction, Query};
use sanctuary_shared::constants::{
    COLUMN_CREATED_AT, COLUMN_ID, COLUMN_USER_ID, TABLE_PRAYER_REQUESTS, TABLE_PROFILES,
    TABLE_TESTIMONIES,
};
use sanctuary_shared::{ActorId, FetchError, Message, RoomSpec, SendError, Visibility};

use super::decode_row;
use crate::context::ClientContext;
use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_admin: bool,
}

/// Editable profile fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testimony {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

pub struct Profiles {
    ctx: ClientContext,
}

impl Profiles {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    async fn require_actor(&self) -> Result<ActorId, SendError> {
        self.ctx
            .current_actor()
            .await
            .ok_or(SendError::Unauthenticated)
    }

    pub async fn get(&self, user: &ActorId) -> Result<Profile, ServiceError> {
        let rows = self
            .ctx
            .backend
            .select(TABLE_PROFILES, &Query::new().eq(COLUMN_ID, user.as_str()).limit(1))
            .await
            .map_err(FetchError::from)?;

        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::NotFound(format!("profile {user}")))?;
        Ok(decode_row(row).map_err(FetchError::from)?)
    }

    /// Edit a profile. Only its owner may do so.
    pub async fn update(&self, user: &ActorId, update: ProfileUpdate) -> Result<Profile, SendError> {
        let actor = self.require_actor().await?;
        if &actor != user {
            return Err(SendError::Forbidden("profiles can only be edited by their owner".into()));
        }

        let patch = serde_json::to_value(&update)
            .map_err(|e| SendError::Rejected(format!("Unencodable update: {e}")))?;
        let row = self
            .ctx
            .backend
            .update(TABLE_PROFILES, user.as_str(), patch)
            .await?;

        info!(actor = %actor.short(), "Profile updated");
        decode_row(row).map_err(|e| SendError::Rejected(e.to_string()))
    }

    /// A user's prayer requests, newest first. Private ones are listed only
    /// for their owner.
    pub async fn prayer_requests_of(&self, user: &ActorId) -> Result<Vec<Message>, FetchError> {
        let spec = RoomSpec::prayer_wall();
        let visibility = Visibility::for_actor(self.ctx.current_actor().await);
        let query = Query::new()
            .eq(COLUMN_USER_ID, user.as_str())
            .visible_to(&visibility)
            .order_by(COLUMN_CREATED_AT, Direction::Descending);

        let rows = self.ctx.backend.select(TABLE_PRAYER_REQUESTS, &query).await?;
        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            match spec.message_from_row(row) {
                Ok(request) => requests.push(request),
                Err(e) => warn!(error = %e, "Skipping malformed prayer request"),
            }
        }
        Ok(requests)
    }

    /// A user's testimonies, newest first.
    pub async fn testimonies_of(&self, user: &ActorId) -> Result<Vec<Testimony>, FetchError> {
        let query = Query::new()
            .eq(COLUMN_USER_ID, user.as_str())
            .order_by(COLUMN_CREATED_AT, Direction::Descending);

        let rows = self.ctx.backend.select(TABLE_TESTIMONIES, &query).await?;
        rows.into_iter()
            .map(|row| decode_row(row).map_err(FetchError::from))
            .collect()
    }

    pub async fn share_testimony(&self, title: &str, content: &str) -> Result<Testimony, SendError> {
        let actor = self.require_actor().await?;
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyBody);
        }

        let row: Value = json!({
            COLUMN_USER_ID: actor.as_str(),
            "title": title.trim(),
            "content": content,
        });
        let committed = self.ctx.backend.insert(TABLE_TESTIMONIES, row).await?;
        decode_row(committed).map_err(|e| SendError::Rejected(e.to_string()))
    }

    pub async fn delete_prayer_request(&self, id: &str) -> Result<(), SendError> {
        let actor = self.require_actor().await?;
        self.ctx.backend.delete(TABLE_PRAYER_REQUESTS, id).await?;
        info!(actor = %actor.short(), id, "Prayer request deleted");
        Ok(())
    }

    pub async fn delete_testimony(&self, id: &str) -> Result<(), SendError> {
        let actor = self.require_actor().await?;
        self.ctx.backend.delete(TABLE_TESTIMONIES, id).await?;
        info!(actor = %actor.short(), id, "Testimony deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sanctuary_backend::{MemoryBackend, StaticActor};

    use crate::config::ClientConfig;

    fn setup(actor: Option<&str>) -> (Profiles, Arc<MemoryBackend>) {
        let actors = Arc::new(StaticActor::new(actor.map(ActorId::from)));
        let (ctx, backend, _) = ClientContext::in_memory(actors, ClientConfig::default());
        backend.seed(
            "profiles",
            json!({"id": "u1", "username": "alice", "full_name": null, "bio": "hi"}),
        );
        (Profiles::new(ctx), backend)
    }

    #[tokio::test]
    async fn test_get_and_update_profile() {
        let (profiles, _) = setup(Some("u1"));
        let user = ActorId::from("u1");

        let profile = profiles.get(&user).await.unwrap();
        assert_eq!(profile.username.as_deref(), Some("alice"));

        let updated = profiles
            .update(
                &user,
                ProfileUpdate {
                    bio: Some("Worship team".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.bio.as_deref(), Some("Worship team"));
        assert_eq!(updated.username.as_deref(), Some("alice"));

        let missing = profiles.get(&ActorId::from("nobody")).await;
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_someone_else_is_forbidden() {
        let (profiles, _) = setup(Some("u2"));
        let result = profiles
            .update(&ActorId::from("u1"), ProfileUpdate::default())
            .await;
        assert!(matches!(result, Err(SendError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_testimonies() {
        let (profiles, backend) = setup(Some("u1"));

        let shared = profiles
            .share_testimony("Answered", "  God provided a job  ")
            .await
            .unwrap();
        assert_eq!(shared.content, "God provided a job");

        let listed = profiles.testimonies_of(&ActorId::from("u1")).await.unwrap();
        assert_eq!(listed.len(), 1);

        profiles.delete_testimony(&shared.id).await.unwrap();
        assert!(backend.rows("testimonies").is_empty());

        assert_eq!(
            profiles.share_testimony("Empty", "   ").await,
            Err(SendError::EmptyBody)
        );
    }

    #[tokio::test]
    async fn test_prayer_requests_of_hides_private_from_others() {
        let (profiles, backend) = setup(None);
        backend.seed(
            "prayer_requests",
            json!({"id": "p1", "user_id": "u1", "content": "open", "is_private": false}),
        );
        backend.seed(
            "prayer_requests",
            json!({"id": "p2", "user_id": "u1", "content": "secret", "is_private": true}),
        );

        let listed = profiles.prayer_requests_of(&ActorId::from("u1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].body, "open");

        assert_eq!(
            profiles.delete_prayer_request("p1").await,
            Err(SendError::Unauthenticated)
        );
    }
}
