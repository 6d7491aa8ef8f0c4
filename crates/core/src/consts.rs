pub const VERSION: &str = "0.1.0";

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";
#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Size of the bounded in-process queues used between a socket reader task
/// and the task that consumes its frames (dispatch queue, pending-future
/// notifications, main-thread-dispatch forwarding).
pub const CHANNEL_SIZE: usize = 1024;

/// Key the server publishes its own handle under in the namespace, so a
/// client can bootstrap without a second round-trip.
pub const SELF_KEY: &str = "self";

/// Tag used in the proxy/value envelope to name the payload's logical type.
pub const ENVELOPE_TAG_KEY: &str = "___type_name___";

pub const ENVELOPE_TAG_PROXY: &str = "proxy";
pub const ENVELOPE_TAG_NDARRAY: &str = "ndarray";
pub const ENVELOPE_TAG_DATETIME: &str = "datetime";
pub const ENVELOPE_TAG_DATE: &str = "date";
pub const ENVELOPE_TAG_TUPLE: &str = "tuple";
pub const ENVELOPE_TAG_BYTES: &str = "bytes";

pub const SERIALIZER_TAG_MSGPACK: &str = "msgpack";
pub const SERIALIZER_TAG_JSON: &str = "json";

/// Number of paired timestamp round-trips `Client::measure_clock_diff` uses.
pub const CLOCK_DIFF_SAMPLES: usize = 10;

/// How many times a bootstrapping child retries writing its status frame
/// before giving up on the rendezvous ack.
pub const MAX_BOOTSTRAP_STATUS_RETRIES: u8 = 5;
