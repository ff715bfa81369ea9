// ==== Partition loop metrics ====
/// Counter for messages whose processor returned Ok
pub const MESSAGES_PROCESSED: &str = "kafka_client_messages_processed_total";

/// Counter for messages whose processor returned an error
pub const MESSAGES_FAILED: &str = "kafka_client_messages_failed_total";

/// Counter for records received for a topic without configuration
pub const MESSAGES_UNCONFIGURED_TOPIC: &str = "kafka_client_messages_unconfigured_topic_total";

/// Histogram for processor duration
pub const PROCESSING_DURATION_MS: &str = "kafka_client_processing_duration_ms";

/// Counter for read errors that terminated a partition loop
pub const PARTITION_READ_ERRORS: &str = "kafka_client_partition_read_errors_total";

// ==== Offset commit metrics ====
/// Counter for commits that failed once and were retried
pub const OFFSET_COMMIT_RETRIES: &str = "kafka_client_offset_commit_retries_total";

/// Counter for commits that failed after the retry
pub const OFFSET_COMMIT_FAILURES: &str = "kafka_client_offset_commit_failures_total";

/// Counter for acknowledgments the session could not store
pub const OFFSET_MARK_FAILURES: &str = "kafka_client_offset_mark_failures_total";

// ==== Dead-letter metrics ====
/// Counter for failed messages handed to the router
pub const DEAD_LETTER_ROUTED: &str = "kafka_client_dead_letter_routed_total";

/// Counter for failed messages dropped because the router was full or closed
pub const DEAD_LETTER_DROPPED: &str = "kafka_client_dead_letter_dropped_total";

/// Counter for failed messages republished on their dead-letter topic
pub const DEAD_LETTER_PUBLISHED: &str = "kafka_client_dead_letter_published_total";

/// Counter for failed messages that could not be republished
pub const DEAD_LETTER_PUBLISH_ERRORS: &str = "kafka_client_dead_letter_publish_errors_total";

// ==== Coordination metrics ====
/// Counter for generations started by the generation-based coordinator
pub const GENERATIONS_STARTED: &str = "kafka_client_generations_started_total";

/// Counter for sessions started by the session-based coordinator
pub const SESSIONS_STARTED: &str = "kafka_client_sessions_started_total";

/// Counter for failed attempts to join or consume a membership epoch
pub const COORDINATION_ERRORS: &str = "kafka_client_coordination_errors_total";

/// Counter for records dropped by the group client because no claim owned the partition
pub const UNROUTED_MESSAGES: &str = "kafka_client_unrouted_messages_total";

/// Counter for errors returned by the consumer poll, which carry no partition
pub const CONSUMER_RECV_ERRORS: &str = "kafka_client_consumer_recv_errors_total";

/// Counter for partitions paused because their claim's buffer was full
pub const PARTITIONS_PAUSED: &str = "kafka_client_partitions_paused_total";

/// Gauge for partitions assigned in the current epoch
pub const ASSIGNED_PARTITIONS: &str = "kafka_client_assigned_partitions";

// ==== Producer metrics ====
/// Counter for produced messages acknowledged by the broker
pub const PRODUCER_SEND_SUCCESS: &str = "kafka_client_producer_send_success_total";

/// Counter for produce failures (sync or async)
pub const PRODUCER_SEND_ERRORS: &str = "kafka_client_producer_send_errors_total";

/// Counter for payloads that could not be encoded
pub const PRODUCER_ENCODE_ERRORS: &str = "kafka_client_producer_encode_errors_total";

/// Histogram for synchronous send duration
pub const PRODUCER_SEND_DURATION_MS: &str = "kafka_client_producer_send_duration_ms";
