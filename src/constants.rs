/// Queue and default constants shared across the gateway, consumer and CLI

// Versioned so a payload schema change can move to a new queue while
// in-flight consumers drain the old one.
pub const DEVICE_REGISTRATIONS_QUEUE: &str = "device-registrations.v1";

// Consumer defaults
pub const DEFAULT_INGESTION_ENDPOINT: &str = "http://localhost:3001/api/ingestion/mock";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 400;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

// Server defaults
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3001;

// Storage defaults
pub const DEFAULT_DATA_ROOT: &str = "data";
pub const SQLITE_FILE_NAME: &str = "device_pipeline.db";
pub const DEFAULT_CONFIG_FILE: &str = "device_pipeline.toml";
