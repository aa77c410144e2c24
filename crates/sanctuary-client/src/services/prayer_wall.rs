use serde_json::{json, Map, Value};
use tracing::info;

use sanctuary_shared::constants::{
    COLUMN_IS_ANONYMOUS, COLUMN_IS_PRIVATE, COLUMN_USER_ID, PRAYER_TITLE_CHARS,
    TABLE_PRAYER_INTERACTIONS,
};
use sanctuary_shared::{Message, RoomSpec, SendError, Visibility};

use crate::context::ClientContext;
use crate::error::StartError;
use crate::session::{self, RoomSession};

const INTERACTION_PRAYER: &str = "prayer";

/// Title shown on the wall: the leading characters of the request, with an
/// ellipsis when cut.
pub fn prayer_title(content: &str) -> String {
    let mut title: String = content.chars().take(PRAYER_TITLE_CHARS).collect();
    if content.chars().nth(PRAYER_TITLE_CHARS).is_some() {
        title.push_str("...");
    }
    title
}

pub struct PrayerWall {
    ctx: ClientContext,
}

impl PrayerWall {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Public requests, plus the current actor's private ones.
    pub async fn open(&self) -> Result<RoomSession, StartError> {
        let visibility = Visibility::for_actor(self.ctx.current_actor().await);
        self.ctx.open_room(RoomSpec::prayer_wall(), visibility).await
    }

    pub async fn submit(
        &self,
        content: &str,
        anonymous: bool,
        private: bool,
    ) -> Result<Message, SendError> {
        let mut extra = Map::new();
        extra.insert("title".to_string(), json!(prayer_title(content.trim())));
        extra.insert(COLUMN_IS_ANONYMOUS.to_string(), Value::Bool(anonymous));
        extra.insert(COLUMN_IS_PRIVATE.to_string(), Value::Bool(private));

        session::post(
            self.ctx.backend.as_ref(),
            self.ctx.actors.as_ref(),
            &RoomSpec::prayer_wall(),
            content,
            extra,
        )
        .await
    }

    /// Record that the current actor prayed for a request.
    pub async fn pray_for(&self, prayer_id: &str) -> Result<(), SendError> {
        let actor = self
            .ctx
            .current_actor()
            .await
            .ok_or(SendError::Unauthenticated)?;

        let row = json!({
            COLUMN_USER_ID: actor.as_str(),
            "prayer_id": prayer_id,
            "interaction_type": INTERACTION_PRAYER,
        });
        self.ctx
            .backend
            .insert(TABLE_PRAYER_INTERACTIONS, row)
            .await?;

        info!(prayer = prayer_id, actor = %actor.short(), "Prayer recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sanctuary_backend::StaticActor;

    use crate::config::ClientConfig;
    use crate::session::SessionState;

    #[test]
    fn test_prayer_title() {
        assert_eq!(prayer_title("Short request"), "Short request");

        let long = "a".repeat(60);
        assert_eq!(prayer_title(&long), format!("{}...", "a".repeat(50)));

        let exact = "é".repeat(50);
        assert_eq!(prayer_title(&exact), exact);
    }

    #[tokio::test]
    async fn test_submit_sets_columns() {
        let (ctx, backend, _) = ClientContext::in_memory(
            Arc::new(StaticActor::signed_in("u1")),
            ClientConfig::default(),
        );
        let wall = PrayerWall::new(ctx);

        let message = wall.submit("  Please pray for my family  ", true, false).await.unwrap();
        assert_eq!(message.body, "Please pray for my family");
        assert!(message.is_anonymous());
        assert_eq!(message.attribute_str("title"), Some("Please pray for my family"));
        assert_eq!(backend.rows("prayer_requests").len(), 1);
    }

    #[tokio::test]
    async fn test_private_requests_visible_to_owner_only() {
        let (ctx, backend, _) = ClientContext::in_memory(
            Arc::new(StaticActor::signed_in("u1")),
            ClientConfig::default(),
        );
        backend.seed(
            "prayer_requests",
            json!({"id": "p1", "user_id": "u2", "content": "public", "is_private": false}),
        );
        backend.seed(
            "prayer_requests",
            json!({"id": "p2", "user_id": "u2", "content": "hidden", "is_private": true}),
        );
        backend.seed(
            "prayer_requests",
            json!({"id": "p3", "user_id": "u1", "content": "mine", "is_private": true}),
        );

        let session = PrayerWall::new(ctx).open().await.unwrap();
        assert_eq!(session.state(), SessionState::Live);
        let ids: Vec<String> = session
            .current_messages()
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_pray_for_requires_actor() {
        let actors = Arc::new(StaticActor::anonymous());
        let (ctx, backend, _) = ClientContext::in_memory(actors.clone(), ClientConfig::default());
        let wall = PrayerWall::new(ctx);

        assert_eq!(wall.pray_for("p1").await, Err(SendError::Unauthenticated));

        actors.set(Some("u1".into()));
        wall.pray_for("p1").await.unwrap();
        let rows = backend.rows("prayer_interactions");
        assert_eq!(rows[0]["interaction_type"], "prayer");
        assert_eq!(rows[0]["prayer_id"], "p1");
    }
}
