//! Chunked concurrent execution with inter-batch pacing
//!
//! Items are split into contiguous chunks. Every member of a chunk runs
//! concurrently and the whole chunk settles before the next one starts.
//! Results come back in input order; per-item failures are the operation's
//! business and must be encoded in its output type.

use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Chunk size and pacing for a batch run
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Items run concurrently per chunk
    pub batch_size: usize,
    /// Pause between chunks, never after the last one
    pub inter_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::light()
    }
}

impl BatchConfig {
    /// For cheap read-only endpoints
    pub fn light() -> Self {
        Self {
            batch_size: 10,
            inter_batch_delay: Duration::from_secs(1),
        }
    }

    /// For endpoints with a heavy per-call cost
    pub fn heavy() -> Self {
        Self {
            batch_size: 3,
            inter_batch_delay: Duration::from_secs(1),
        }
    }
}

/// Progress reported after each chunk settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    /// 1-based index of the chunk that just finished
    pub batch: usize,
    pub batches: usize,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

/// Drives a per-item operation over a collection in paced chunks
#[derive(Debug, Clone, Default)]
pub struct BatchOrchestrator {
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run `op` over `items`, logging progress after each chunk
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, op: F) -> Vec<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_with_progress(items, op, |progress| {
            debug!(
                completed = progress.completed,
                total = progress.total,
                batch = progress.batch,
                batches = progress.batches,
                "Batch completed"
            );
        })
        .await
    }

    /// Run `op` over `items`, calling `on_progress` after each chunk
    pub async fn run_with_progress<I, T, F, Fut, P>(
        &self,
        items: Vec<I>,
        op: F,
        mut on_progress: P,
    ) -> Vec<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
        P: FnMut(BatchProgress),
    {
        let total = items.len();
        let batch_size = self.config.batch_size.max(1);
        let batches = total.div_ceil(batch_size);

        let mut results = Vec::with_capacity(total);
        let mut remaining = items.into_iter().peekable();
        let mut batch = 0;

        while remaining.peek().is_some() {
            let chunk: Vec<I> = remaining.by_ref().take(batch_size).collect();

            // join_all yields outputs positionally, not in completion order
            let outputs = join_all(chunk.into_iter().map(&op)).await;
            results.extend(outputs);
            batch += 1;

            on_progress(BatchProgress {
                completed: results.len(),
                total,
                batch,
                batches,
            });

            if remaining.peek().is_some() {
                sleep(self.config.inter_batch_delay).await;
            }
        }

        results
    }
}
