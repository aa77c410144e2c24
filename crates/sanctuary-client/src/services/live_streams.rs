use serde::{Deserialize, Serialize};
use tracing::warn;

use sanctuary_backend::Query;
use sanctuary_shared::constants::TABLE_LIVE_STREAMS;
use sanctuary_shared::{FetchError, RoomSpec};

use super::decode_row;
use crate::context::ClientContext;

const YOUTUBE_WATCH: &str = "youtube.com/watch?v=";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStream {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

impl LiveStream {
    /// Chat room for this stream.
    pub fn chat_room(&self) -> RoomSpec {
        RoomSpec::stream_chat(&self.id)
    }
}

/// Player URL for a stream. On mobile, YouTube watch links are rewritten to
/// the inline embed player; everything else is returned unchanged.
pub fn embed_url(url: &str, mobile: bool) -> String {
    if !mobile {
        return url.to_string();
    }
    let Some(start) = url.find(YOUTUBE_WATCH) else {
        return url.to_string();
    };

    let video_id = url[start + YOUTUBE_WATCH.len()..]
        .split('&')
        .next()
        .unwrap_or_default();
    format!("https://www.youtube.com/embed/{video_id}?playsinline=1")
}

pub struct LiveStreams {
    ctx: ClientContext,
}

impl LiveStreams {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Streams currently marked active.
    pub async fn active(&self) -> Result<Vec<LiveStream>, FetchError> {
        let rows = self
            .ctx
            .backend
            .select(TABLE_LIVE_STREAMS, &Query::new().eq("is_active", "true"))
            .await?;

        let mut streams = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_row::<LiveStream>(row) {
                Ok(stream) => streams.push(stream),
                Err(e) => warn!(error = %e, "Skipping malformed stream row"),
            }
        }
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sanctuary_backend::StaticActor;
    use serde_json::json;
    use std::sync::Arc;

    use crate::config::ClientConfig;

    #[test]
    fn test_embed_url() {
        assert_eq!(
            embed_url("https://www.youtube.com/watch?v=abc123&t=42", true),
            "https://www.youtube.com/embed/abc123?playsinline=1"
        );
        assert_eq!(
            embed_url("https://www.youtube.com/watch?v=abc123", false),
            "https://www.youtube.com/watch?v=abc123"
        );
        assert_eq!(
            embed_url("https://vimeo.com/1234", true),
            "https://vimeo.com/1234"
        );
    }

    #[tokio::test]
    async fn test_active_streams_only() {
        let (ctx, backend, _) =
            ClientContext::in_memory(Arc::new(StaticActor::anonymous()), ClientConfig::default());
        backend.seed(
            "live_streams",
            json!({"id": "s1", "name": "Sunday", "url": "https://x/1", "is_active": true}),
        );
        backend.seed(
            "live_streams",
            json!({"id": "s2", "name": "Old", "url": "https://x/2", "is_active": false}),
        );

        let streams = LiveStreams::new(ctx).active().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].name, "Sunday");
        assert_eq!(streams[0].chat_room().room_id.as_str(), "stream_chat:s1");
    }
}
