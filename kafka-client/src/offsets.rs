use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::CommitError;
use crate::metrics_consts::{OFFSET_COMMIT_FAILURES, OFFSET_COMMIT_RETRIES};

/// topic -> partition -> offset
pub type OffsetMap = HashMap<String, HashMap<i32, i64>>;

pub fn single_offset(topic: &str, partition: i32, offset: i64) -> OffsetMap {
    HashMap::from([(topic.to_string(), HashMap::from([(partition, offset)]))])
}

/// Anything able to durably record consumer progress for a group.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit_offsets(&self, offsets: &OffsetMap) -> Result<(), CommitError>;
}

/// Commits one (topic, partition, offset), retrying exactly once right away.
///
/// A second failure is logged and returned but never fatal: the loop keeps going and a
/// restart resumes from the last offset that did get committed.
pub async fn commit_with_retry<C>(
    committer: &C,
    topic: &str,
    partition: i32,
    offset: i64,
) -> Result<(), CommitError>
where
    C: OffsetCommitter + ?Sized,
{
    let offsets = single_offset(topic, partition, offset);

    let Err(first) = committer.commit_offsets(&offsets).await else {
        debug!(topic, partition, offset, "committed offset");
        return Ok(());
    };

    warn!(
        topic,
        partition, offset, "failed to commit offset, retrying: {}", first
    );
    metrics::counter!(OFFSET_COMMIT_RETRIES, "topic" => topic.to_string()).increment(1);

    match committer.commit_offsets(&offsets).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(topic, partition, offset, "failed to commit offset: {}", e);
            metrics::counter!(OFFSET_COMMIT_FAILURES, "topic" => topic.to_string()).increment(1);
            Err(e)
        }
    }
}
