/// Application name
pub const APP_NAME: &str = "Sanctuary";

/// Number of most recent messages fetched when a room session starts
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 50;

/// Capacity of the bounded event queue between a connection and a session
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Realtime heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// How long a channel join may wait for the backend's reply
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;

/// Default backend base URL (local development stack)
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:54321";

/// Database schema holding the application tables
pub const DEFAULT_SCHEMA: &str = "public";

/// Backend error code for "insufficient privilege"
pub const PERMISSION_DENIED_CODE: &str = "42501";

/// Display name used when a record carries no author profile
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// Prayer request titles are derived from this many leading characters
pub const PRAYER_TITLE_CHARS: usize = 50;

// Table names
pub const TABLE_STREAM_CHAT: &str = "stream_chat";
pub const TABLE_PRAYER_CHAT: &str = "prayer_chat";
pub const TABLE_PRAYER_REQUESTS: &str = "prayer_requests";
pub const TABLE_PRAYER_INTERACTIONS: &str = "prayer_interactions";
pub const TABLE_LIVE_STREAMS: &str = "live_streams";
pub const TABLE_PROFILES: &str = "profiles";
pub const TABLE_TESTIMONIES: &str = "testimonies";

// Column names common to the chat tables
pub const COLUMN_ID: &str = "id";
pub const COLUMN_USER_ID: &str = "user_id";
pub const COLUMN_CREATED_AT: &str = "created_at";
pub const COLUMN_IS_PRIVATE: &str = "is_private";
pub const COLUMN_IS_ANONYMOUS: &str = "is_anonymous";

/// Key under which the author profile is embedded in fetched rows
pub const PROFILE_EMBED_KEY: &str = "profiles";

/// PostgREST projection embedding the author's display fields
pub const PROFILE_EMBED_SELECT: &str = "*,profiles:user_id(username,avatar_url)";
