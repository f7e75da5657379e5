// ==== Source metrics ====
/// Counter for records pulled from the source
pub const SOURCE_MESSAGES_RECEIVED: &str = "spine_source_messages_received_total";

// ==== Transform metrics ====
/// Counter for messages passed through a per-message transform, labelled by outcome
pub const TRANSFORM_MESSAGES: &str = "spine_transform_messages_total";

// ==== Chunked batcher metrics ====
/// Counter for batch flushes, labelled by what triggered them (size, timeout, drain)
pub const BATCH_FLUSHES: &str = "spine_batch_flushes_total";

/// Histogram for the number of messages in each flushed batch
pub const BATCH_SIZE: &str = "spine_batch_size";

/// Histogram for the time spent processing and emitting one flush
pub const BATCH_FLUSH_DURATION_MS: &str = "spine_batch_flush_duration_ms";

/// Counter for per-item batch results, labelled by outcome
pub const BATCH_MESSAGES: &str = "spine_batch_messages_total";

// ==== Sink metrics ====
/// Counter for acknowledgment attempts, labelled by outcome
pub const ACK_ATTEMPTS: &str = "spine_ack_attempts_total";

/// Counter for fatal pipeline errors, labelled by error kind
pub const PIPELINE_ERRORS: &str = "spine_pipeline_errors_total";
