use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::chains::error::ChainError;
use crate::chains::polygon::{decode_transfer, DecodedTransfer, LogEntry, PolygonClient};
use crate::utils::retry_policy::ExponentialBackoff;

/// Reduced chunk sizes tried, in order, after the configured default fails.
const CHUNK_LADDER_TAIL: [u64; 4] = [100, 50, 25, 16];

/// Whether a provider error is worth retrying at a smaller chunk size.
///
/// Providers phrase range and rate limits inconsistently ("range too large",
/// "query returned more than 10000 results", plain HTTP 400/429), so this
/// matches substrings rather than exact codes. Load-bearing: keep every rule
/// here and nowhere else.
pub(crate) fn is_retryable(message: &str) -> bool {
    let lowered = message.to_lowercase();

    lowered.contains("400")
        || lowered.contains("429")
        || lowered.contains("range too large")
        || lowered.contains("block range")
        || lowered.contains("too many results")
        || lowered.contains("more than")
        || lowered.contains("rate limit")
        || lowered.contains("too many requests")
        || lowered.contains("timeout")
}

/// A source of transfer logs for a block range.
#[async_trait]
pub(crate) trait LogSource: Send + Sync {
    async fn fetch(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, ChainError>;
}

#[async_trait]
impl LogSource for PolygonClient {
    async fn fetch(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, ChainError> {
        self.transfer_logs(from_block, to_block).await
    }
}

/// One fully scanned contiguous range and the deposit-relevant transfers in
/// it. The caller records the transfers, then advances the cursor to
/// `to_block`.
#[derive(Debug)]
pub(crate) struct ScannedChunk {
    pub(crate) to_block: u64,
    pub(crate) transfers: Vec<DecodedTransfer>,
}

/// Result of one scan pass. `error` is set when the pass aborted early; the
/// chunks collected before the abort are still valid and fully scanned.
#[derive(Debug)]
pub(crate) struct ScanOutcome {
    pub(crate) chunks: Vec<ScannedChunk>,
    pub(crate) error: Option<String>,
}

/// Chunked, adaptively-sized scan over transfer logs.
///
/// Starts every chunk at the configured default size and degrades through a
/// fixed ladder on retryable provider errors, retrying the same `from_block`
/// each time (unscanned blocks are never skipped). Success at a reduced size
/// resets the next chunk to the default, on the assumption the constraint was
/// transient.
pub(crate) struct LogScanner<'a, S: LogSource> {
    source: &'a S,
    default_chunk: u64,
    backoff: ExponentialBackoff,
}

impl<'a, S: LogSource> LogScanner<'a, S> {
    pub(crate) fn new(source: &'a S, default_chunk: u64) -> Self {
        Self::with_backoff(source, default_chunk, ExponentialBackoff::new(4, 30, 1.5))
    }

    pub(crate) fn with_backoff(
        source: &'a S,
        default_chunk: u64,
        backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            source,
            default_chunk,
            backoff,
        }
    }

    fn ladder(&self) -> Vec<u64> {
        let mut sizes = vec![self.default_chunk.max(1)];
        sizes.extend(CHUNK_LADDER_TAIL.iter().filter(|&&s| s < self.default_chunk));
        sizes
    }

    /// Scan `[from_block, head]`, filtering each chunk's transfers to the
    /// given deposit-address set (lowercase form) before returning them.
    pub(crate) async fn scan(
        &self,
        from_block: u64,
        head: u64,
        addresses: &HashSet<String>,
    ) -> ScanOutcome {
        let ladder = self.ladder();
        let mut chunks = Vec::new();
        let mut from = from_block;

        while from <= head {
            let mut step = 0usize;

            let (to, logs) = loop {
                let size = ladder[step];
                let to = (from + size - 1).min(head);

                match self.source.fetch(from, to).await {
                    Ok(logs) => {
                        debug!(from, to, count = logs.len(), "Scanned log chunk");
                        break (to, logs);
                    }
                    Err(e) => {
                        let message = e.to_string();
                        if !is_retryable(&message) {
                            return ScanOutcome {
                                chunks,
                                error: Some(message),
                            };
                        }
                        if step + 1 >= ladder.len() {
                            return ScanOutcome {
                                chunks,
                                error: Some(format!("chunk ladder exhausted: {message}")),
                            };
                        }

                        step += 1;
                        let delay = self.backoff.get_delay(step as u64);
                        warn!(
                            from,
                            chunk_size = ladder[step],
                            delay_secs = delay,
                            error = %message,
                            "Retryable scan failure, reducing chunk size"
                        );
                        sleep(Duration::from_secs(delay)).await;
                    }
                }
            };

            let transfers = logs
                .iter()
                .filter_map(|entry| match decode_transfer(entry) {
                    Ok(transfer) => Some(transfer),
                    Err(e) => {
                        warn!(tx = %entry.transaction_hash, error = %e, "Skipping undecodable log");
                        None
                    }
                })
                .filter(|transfer| addresses.contains(&transfer.to_address()))
                .collect();

            chunks.push(ScannedChunk {
                to_block: to,
                transfers,
            });
            from = to + 1;
        }

        ScanOutcome {
            chunks,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::polygon::tests::transfer_log_json;
    use std::sync::Mutex;

    /// Scripted log source: pops one canned response per fetch and records
    /// the requested ranges.
    struct ScriptedSource {
        responses: Mutex<Vec<Result<Vec<LogEntry>, ChainError>>>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<LogEntry>, ChainError>>) -> Self {
            let mut responses = responses;
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(u64, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        async fn fetch(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, ChainError> {
            self.calls.lock().unwrap().push((from_block, to_block));
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn no_delay() -> ExponentialBackoff {
        ExponentialBackoff::new(4, 0, 1.5)
    }

    fn range_error() -> ChainError {
        ChainError::Rpc("query returned more than 10000 results".to_string())
    }

    fn log_for(address: &str, value: u128, block: u64, tx: &str) -> LogEntry {
        serde_json::from_value(transfer_log_json(address, value, block, tx)).unwrap()
    }

    #[tokio::test]
    async fn degrades_through_the_ladder_and_resets() {
        let source = ScriptedSource::new(vec![
            Err(range_error()),
            Err(range_error()),
            Ok(Vec::new()),
            Ok(Vec::new()),
        ]);
        let scanner = LogScanner::with_backoff(&source, 1000, no_delay());

        let outcome = scanner.scan(1, 1500, &HashSet::new()).await;

        assert!(outcome.error.is_none());
        // Same from_block at shrinking sizes, then the default size again.
        assert_eq!(
            source.calls(),
            vec![(1, 1000), (1, 100), (1, 50), (51, 1050), (1051, 1500)]
        );
        assert_eq!(outcome.chunks.len(), 3);
        assert_eq!(outcome.chunks.last().unwrap().to_block, 1500);
    }

    #[tokio::test]
    async fn aborts_on_non_retryable_errors() {
        let source = ScriptedSource::new(vec![
            Ok(Vec::new()),
            Err(ChainError::Rpc("execution reverted".to_string())),
        ]);
        let scanner = LogScanner::with_backoff(&source, 100, no_delay());

        let outcome = scanner.scan(1, 300, &HashSet::new()).await;

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.chunks[0].to_block, 100);
        assert!(outcome.error.unwrap().contains("execution reverted"));
    }

    #[tokio::test]
    async fn exhausting_the_ladder_aborts_without_skipping_blocks() {
        let source = ScriptedSource::new(vec![
            Err(range_error()),
            Err(range_error()),
            Err(range_error()),
            Err(range_error()),
            Err(range_error()),
        ]);
        let scanner = LogScanner::with_backoff(&source, 1000, no_delay());

        let outcome = scanner.scan(1, 5000, &HashSet::new()).await;

        assert!(outcome.chunks.is_empty());
        assert!(outcome.error.unwrap().contains("chunk ladder exhausted"));
        // Every attempt re-tried the same from_block.
        assert!(source.calls().iter().all(|(from, _)| *from == 1));
    }

    #[tokio::test]
    async fn filters_transfers_to_the_deposit_address_set() {
        let ours = "0x2222222222222222222222222222222222222222";
        let theirs = "0x3333333333333333333333333333333333333333";
        let source = ScriptedSource::new(vec![Ok(vec![
            log_for(ours, 1_500_000, 10, "0x00000000000000000000000000000000000000000000000000000000000000aa"),
            log_for(theirs, 9_000_000, 11, "0x00000000000000000000000000000000000000000000000000000000000000bb"),
        ])]);
        let scanner = LogScanner::with_backoff(&source, 100, no_delay());

        let addresses: HashSet<String> = [ours.to_string()].into();
        let outcome = scanner.scan(1, 100, &addresses).await;

        assert!(outcome.error.is_none());
        let transfers: Vec<_> = outcome
            .chunks
            .iter()
            .flat_map(|c| c.transfers.iter())
            .collect();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].to_address(), ours);
    }

    #[test]
    fn retryability_matches_provider_wording() {
        assert!(is_retryable("HTTP 400 Bad Request"));
        assert!(is_retryable("429 Too Many Requests"));
        assert!(is_retryable("eth_getLogs block range too large"));
        assert!(is_retryable("query returned more than 10000 results"));
        assert!(is_retryable("rate limit exceeded, slow down"));
        assert!(is_retryable("request timeout after 30s"));

        assert!(!is_retryable("execution reverted"));
        assert!(!is_retryable("invalid address checksum"));
        assert!(!is_retryable("unknown block"));
    }
}
