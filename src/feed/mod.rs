//! Push-style delivery of the committed stream into external sinkers.
//!
//! Every feed follows the same skeleton: seed the position from the sinker's
//! durable resume tokens, cover the backlog, then tail the backend's change
//! mechanism, normalising each change to the event model. Connection loss
//! reconnects with backoff from the last durable token; sinker and decode
//! errors are fatal so nothing is ever skipped silently.

pub mod mongo;
pub mod mysql;
pub mod postgres;

use std::time::Duration;

use crate::{
    error::{Result, StoreError},
    event::{Event, ResumeToken},
    filter::Filter,
    sink::Sinker,
};

pub use mongo::{MongoChangeFeed, MongoFeedConfig};
pub use mysql::{BinlogPosition, MySqlBinlogFeed, MySqlFeedConfig};
pub use postgres::PgListenFeed;

const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(60);

/// Scans the partition range and folds the sinker's stored tokens into the
/// newest one. `newer(candidate, current)` supplies the backend-specific
/// recency comparison.
pub async fn seed_resume_token<F>(
    sinker: &dyn Sinker,
    partition_low: u32,
    partition_hi: u32,
    mut newer: F,
) -> Result<Option<ResumeToken>>
where
    F: FnMut(&[u8], &[u8]) -> bool,
{
    let mut newest: Option<ResumeToken> = None;
    for partition in partition_low..=partition_hi {
        if let Some(token) = sinker.last_resume_token(partition).await? {
            match &newest {
                Some(current) if !newer(&token, current) => {}
                _ => newest = Some(token),
            }
        }
    }
    Ok(newest)
}

/// Hands one event to the sinker, rewrapping any failure as
/// [`StoreError::Sink`] so the feed's reconnect logic never mistakes a
/// delivery failure for a connection problem.
pub(crate) async fn deliver(sinker: &dyn Sinker, event: &Event) -> Result<()> {
    sinker.sink(event).await.map_err(|err| match err {
        StoreError::Sink(_) => err,
        other => StoreError::Sink(other.to_string()),
    })
}

/// Partition range claimed by a filter: `[0, 0]` when partitioning is off.
pub(crate) fn partition_range(filter: &Filter) -> (u32, u32) {
    if filter.partitions == 0 {
        (0, 0)
    } else {
        (filter.partition_low, filter.partition_hi)
    }
}

/// Doubling reconnect delay, capped at one minute.
pub(crate) struct Backoff {
    initial: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration) -> Self {
        Self {
            initial,
            current: initial,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(MAX_RECONNECT_WAIT);
        wait
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{event::Event, sink::MemSinker};

    struct FailingSinker;

    #[async_trait]
    impl Sinker for FailingSinker {
        async fn sink(&self, _event: &Event) -> Result<()> {
            unreachable!("seed never delivers")
        }

        async fn last_resume_token(&self, _partition: u32) -> Result<Option<ResumeToken>> {
            Err(crate::StoreError::Backend("sink store offline".into()))
        }
    }

    #[tokio::test]
    async fn seed_folds_newest_token_across_partitions() {
        let sinker = MemSinker::new(4);
        sinker.set_resume_token(0, b"aaa".to_vec());
        sinker.set_resume_token(2, b"ccc".to_vec());
        sinker.set_resume_token(3, b"bbb".to_vec());

        let newest = seed_resume_token(&sinker, 0, 3, |a, b| a > b)
            .await
            .unwrap();
        assert_eq!(newest, Some(b"ccc".to_vec()));
    }

    #[tokio::test]
    async fn seed_is_none_for_a_fresh_sinker() {
        let sinker = MemSinker::new(1);
        let newest = seed_resume_token(&sinker, 0, 0, |a, b| a > b)
            .await
            .unwrap();
        assert_eq!(newest, None);
    }

    #[tokio::test]
    async fn seed_surfaces_sinker_errors() {
        let result = seed_resume_token(&FailingSinker, 0, 0, |a, b| a > b).await;
        assert!(result.is_err());
    }

    #[test]
    fn backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }
}
