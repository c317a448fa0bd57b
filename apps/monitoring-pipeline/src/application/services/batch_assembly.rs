//! Batch Assembly Service
//!
//! Owns the reassembler for chunked monitoring transfers, records its
//! anomalies and evictions, and runs the periodic staleness sweep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::batch::{
    BatchChunk, BatchReassembler, CompletedBatch, IngestOutcome, ReassemblerStats, ReassemblyConfig,
};
use crate::domain::monitoring::DataPoint;
use crate::infrastructure::metrics;

/// Thread-safe wrapper around [`BatchReassembler`].
#[derive(Debug)]
pub struct BatchAssemblyService {
    reassembler: Mutex<BatchReassembler<DataPoint>>,
    sweep_interval: Duration,
}

impl BatchAssemblyService {
    /// Create a service.
    #[must_use]
    pub fn new(config: ReassemblyConfig, sweep_interval: Duration) -> Self {
        Self {
            reassembler: Mutex::new(BatchReassembler::new(config)),
            sweep_interval,
        }
    }

    /// Ingest a chunk, returning the completed batch when it was the last one.
    pub fn ingest(&self, chunk: BatchChunk<DataPoint>) -> Option<CompletedBatch<DataPoint>> {
        let batch_id = chunk.batch_id.clone();
        let outcome = self.reassembler.lock().ingest(chunk, Instant::now().into_std());

        match outcome {
            IngestOutcome::Pending { received, total } => {
                tracing::trace!(batch_id = %batch_id, received, total, "Chunk buffered");
                None
            }
            IngestOutcome::Completed(batch) => {
                tracing::debug!(
                    batch_id = %batch.batch_id,
                    equipment_id = %batch.equipment_id,
                    chunks = batch.total_chunks,
                    points = batch.data.len(),
                    is_history = batch.is_history,
                    "Batch reassembled"
                );
                metrics::record_batch_completed(batch.is_history);
                Some(batch)
            }
            IngestOutcome::Rejected(anomaly) => {
                tracing::warn!(batch_id = %batch_id, kind = anomaly.kind(), error = %anomaly, "Dropped chunk");
                metrics::record_protocol_anomaly(anomaly.kind());
                None
            }
        }
    }

    /// Evict stale batches now. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let evicted = self.reassembler.lock().evict_stale(Instant::now().into_std());
        for batch in &evicted {
            tracing::warn!(
                batch_id = %batch.batch_id,
                equipment_id = %batch.equipment_id,
                received = batch.received,
                total = batch.total_chunks,
                age_secs = batch.age.as_secs(),
                "Evicted incomplete batch"
            );
        }
        if !evicted.is_empty() {
            metrics::record_batches_evicted(evicted.len() as u64);
        }
        evicted.len()
    }

    /// Run the staleness sweep until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        tracing::debug!("Batch sweeper stopped");
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ReassemblerStats {
        self.reassembler.lock().stats()
    }
}
