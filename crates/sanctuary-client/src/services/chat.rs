//! Live-stream chat and per-prayer chat. Both are plain rooms with no
//! row-level visibility rule.

use sanctuary_shared::{RoomSpec, Visibility};

use crate::context::ClientContext;
use crate::error::StartError;
use crate::session::RoomSession;

pub struct StreamChat {
    ctx: ClientContext,
}

impl StreamChat {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Chat for one live stream.
    pub async fn open(&self, stream_id: &str) -> Result<RoomSession, StartError> {
        self.ctx
            .open_room(RoomSpec::stream_chat(stream_id), Visibility::Everyone)
            .await
    }
}

pub struct PrayerChat {
    ctx: ClientContext,
}

impl PrayerChat {
    pub fn new(ctx: ClientContext) -> Self {
        Self { ctx }
    }

    /// Conversation under one prayer request.
    pub async fn open(&self, prayer_id: &str) -> Result<RoomSession, StartError> {
        self.ctx
            .open_room(RoomSpec::prayer_chat(prayer_id), Visibility::Everyone)
            .await
    }
}
