//! Thin services behind the app's screens.

pub mod chat;
pub mod live_streams;
pub mod prayer_alerts;
pub mod prayer_wall;
pub mod profiles;

pub use chat::{PrayerChat, StreamChat};
pub use live_streams::{embed_url, LiveStream, LiveStreams};
pub use prayer_alerts::{PrayerAlert, PrayerAlerts};
pub use prayer_wall::{prayer_title, PrayerWall};
pub use profiles::{Profile, ProfileUpdate, Profiles, Testimony};

use serde::de::DeserializeOwned;
use serde_json::Value;

use sanctuary_shared::DecodeError;

/// Decode a whole row into a typed record.
fn decode_row<T: DeserializeOwned>(row: Value) -> Result<T, DecodeError> {
    if !row.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    serde_json::from_value(row).map_err(|e| DecodeError::InvalidColumn {
        column: "*".to_string(),
        reason: e.to_string(),
    })
}
