/// Wire protocol version advertised in announcements.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Shared broadcast channel every agent subscribes to by default.
pub const DEFAULT_BROADCAST_CHANNEL: &str = "agent_network";

/// Prefix and suffix of the per-agent direct channel: `agent:<agent_id>:direct`.
pub const DIRECT_CHANNEL_PREFIX: &str = "agent:";
pub const DIRECT_CHANNEL_SUFFIX: &str = ":direct";

/// Priority bounds. 1 is the most urgent; priority is a local scheduling hint only.
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Re-announcement interval.
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 30;

/// Registry time-to-live: three missed announcements.
pub const DEFAULT_REGISTRY_TTL_SECS: u64 = 90;

/// How often stale registry entries are evicted.
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 15;

/// Rolling window of interaction records kept per peer.
pub const DEFAULT_INTERACTION_WINDOW: usize = 50;

/// Outbound messages buffered while the transport is down.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 100;
