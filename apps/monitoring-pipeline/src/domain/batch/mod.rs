//! Chunked batch reassembly.
//!
//! Large transfers arrive as chunks sharing a `batch_id`, each carrying a
//! 1-based `chunk_index` and the batch's `total_chunks`. The
//! [`BatchReassembler`] buffers chunks until every index is present, then
//! emits one [`CompletedBatch`] whose payload is the concatenation of the
//! chunk payloads in index order, whatever the arrival order was.
//!
//! Inconsistent chunks are rejected as [`ProtocolAnomaly`] values rather
//! than errors. Incomplete batches untouched for longer than the staleness
//! window are dropped by [`BatchReassembler::evict_stale`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

/// One piece of a chunked transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchChunk<T> {
    /// Transfer id.
    pub batch_id: String,
    /// Equipment the data belongs to.
    pub equipment_id: String,
    /// 1-based position of this chunk.
    pub chunk_index: u32,
    /// Number of chunks in the batch.
    pub total_chunks: u32,
    /// Historical backfill rather than live data.
    pub is_history: bool,
    /// Items carried by this chunk.
    pub payload: Vec<T>,
}

/// A fully reassembled transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedBatch<T> {
    /// Transfer id.
    pub batch_id: String,
    /// Equipment the data belongs to.
    pub equipment_id: String,
    /// Historical backfill rather than live data.
    pub is_history: bool,
    /// Number of chunks that were joined.
    pub total_chunks: u32,
    /// Concatenated payload in chunk order.
    pub data: Vec<T>,
}

/// Inconsistent chunk metadata. Dropped and counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolAnomaly {
    /// A chunk claimed a batch of zero chunks.
    #[error("batch {batch_id}: total_chunks is zero")]
    ZeroTotalChunks {
        /// Transfer id.
        batch_id: String,
    },

    /// Chunk index outside `1..=total_chunks`.
    #[error("batch {batch_id}: chunk index {index} outside 1..={total}")]
    ChunkIndexOutOfRange {
        /// Transfer id.
        batch_id: String,
        /// Offending index.
        index: u32,
        /// Declared total.
        total: u32,
    },

    /// A later chunk disagreed with the first chunk's total.
    #[error("batch {batch_id}: expected {expected} chunks, chunk declared {got}")]
    TotalChunksMismatch {
        /// Transfer id.
        batch_id: String,
        /// Total recorded from the first chunk.
        expected: u32,
        /// Total declared by the offending chunk.
        got: u32,
    },

    /// A chunk arrived for a batch that was already delivered.
    #[error("batch {batch_id}: chunk arrived after delivery")]
    AlreadyDelivered {
        /// Transfer id.
        batch_id: String,
    },
}

impl ProtocolAnomaly {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ZeroTotalChunks { .. } => "zero_total_chunks",
            Self::ChunkIndexOutOfRange { .. } => "chunk_index_out_of_range",
            Self::TotalChunksMismatch { .. } => "total_chunks_mismatch",
            Self::AlreadyDelivered { .. } => "already_delivered",
        }
    }
}

/// Result of ingesting a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome<T> {
    /// Buffered; the batch is still incomplete.
    Pending {
        /// Distinct chunks received so far.
        received: usize,
        /// Declared total.
        total: u32,
    },
    /// The chunk completed the batch.
    Completed(CompletedBatch<T>),
    /// The chunk was dropped.
    Rejected(ProtocolAnomaly),
}

/// An incomplete batch dropped by the staleness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedBatch {
    /// Transfer id.
    pub batch_id: String,
    /// Equipment the data belonged to.
    pub equipment_id: String,
    /// Distinct chunks received before eviction.
    pub received: usize,
    /// Declared total.
    pub total_chunks: u32,
    /// Time since the batch was created.
    pub age: Duration,
}

/// Reassembler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// An incomplete batch untouched for this long is evicted.
    pub staleness: Duration,
    /// How many delivered batch ids to remember for late-chunk detection.
    pub delivered_memory: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(30),
            delivered_memory: 1024,
        }
    }
}

/// Reassembler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblerStats {
    /// Batches currently buffered.
    pub pending: usize,
    /// Batches delivered.
    pub completed: u64,
    /// Batches dropped by the staleness sweep.
    pub evicted: u64,
    /// Chunks rejected as protocol anomalies.
    pub anomalies: u64,
}

struct BatchAssembly<T> {
    equipment_id: String,
    total_chunks: u32,
    is_history: bool,
    received: BTreeMap<u32, Vec<T>>,
    created_at: Instant,
    updated_at: Instant,
}

/// Buffers chunks per batch id and emits completed batches.
pub struct BatchReassembler<T> {
    config: ReassemblyConfig,
    pending: HashMap<String, BatchAssembly<T>>,
    delivered_order: VecDeque<String>,
    delivered: HashSet<String>,
    stats: ReassemblerStats,
}

impl<T> BatchReassembler<T> {
    /// Create an empty reassembler.
    #[must_use]
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            delivered_order: VecDeque::new(),
            delivered: HashSet::new(),
            stats: ReassemblerStats::default(),
        }
    }

    /// Insert a chunk received at `now`.
    pub fn ingest(&mut self, chunk: BatchChunk<T>, now: Instant) -> IngestOutcome<T> {
        if let Err(anomaly) = self.validate(&chunk) {
            self.stats.anomalies += 1;
            return IngestOutcome::Rejected(anomaly);
        }

        let BatchChunk {
            batch_id,
            equipment_id,
            chunk_index,
            total_chunks,
            is_history,
            payload,
        } = chunk;

        let assembly = self.pending.entry(batch_id.clone()).or_insert_with(|| BatchAssembly {
            equipment_id,
            total_chunks,
            is_history,
            received: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        });
        assembly.received.insert(chunk_index, payload);
        assembly.updated_at = now;

        let received = assembly.received.len();
        let total = assembly.total_chunks;
        if received < total as usize {
            return IngestOutcome::Pending { received, total };
        }

        match self.pending.remove(&batch_id) {
            Some(assembly) => IngestOutcome::Completed(self.complete(batch_id, assembly)),
            None => IngestOutcome::Pending { received, total },
        }
    }

    /// Drop every incomplete batch untouched for longer than the staleness window.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<EvictedBatch> {
        let staleness = self.config.staleness;
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, assembly)| now.saturating_duration_since(assembly.updated_at) > staleness)
            .map(|(batch_id, _)| batch_id.clone())
            .collect();

        let evicted: Vec<EvictedBatch> = stale
            .into_iter()
            .filter_map(|batch_id| {
                self.pending.remove(&batch_id).map(|assembly| EvictedBatch {
                    equipment_id: assembly.equipment_id,
                    received: assembly.received.len(),
                    total_chunks: assembly.total_chunks,
                    age: now.saturating_duration_since(assembly.created_at),
                    batch_id,
                })
            })
            .collect();

        self.stats.evicted += evicted.len() as u64;
        evicted
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            pending: self.pending.len(),
            ..self.stats
        }
    }

    /// Whether a batch is currently buffered.
    #[must_use]
    pub fn is_pending(&self, batch_id: &str) -> bool {
        self.pending.contains_key(batch_id)
    }

    fn validate(&self, chunk: &BatchChunk<T>) -> Result<(), ProtocolAnomaly> {
        if self.delivered.contains(&chunk.batch_id) {
            return Err(ProtocolAnomaly::AlreadyDelivered {
                batch_id: chunk.batch_id.clone(),
            });
        }
        if chunk.total_chunks == 0 {
            return Err(ProtocolAnomaly::ZeroTotalChunks {
                batch_id: chunk.batch_id.clone(),
            });
        }
        if let Some(assembly) = self.pending.get(&chunk.batch_id) {
            if assembly.total_chunks != chunk.total_chunks {
                return Err(ProtocolAnomaly::TotalChunksMismatch {
                    batch_id: chunk.batch_id.clone(),
                    expected: assembly.total_chunks,
                    got: chunk.total_chunks,
                });
            }
        }
        if chunk.chunk_index == 0 || chunk.chunk_index > chunk.total_chunks {
            return Err(ProtocolAnomaly::ChunkIndexOutOfRange {
                batch_id: chunk.batch_id.clone(),
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }
        Ok(())
    }

    fn complete(&mut self, batch_id: String, assembly: BatchAssembly<T>) -> CompletedBatch<T> {
        self.remember_delivered(batch_id.clone());
        self.stats.completed += 1;
        CompletedBatch {
            batch_id,
            equipment_id: assembly.equipment_id,
            is_history: assembly.is_history,
            total_chunks: assembly.total_chunks,
            data: assembly.received.into_values().flatten().collect(),
        }
    }

    fn remember_delivered(&mut self, batch_id: String) {
        if self.config.delivered_memory == 0 {
            return;
        }
        while self.delivered_order.len() >= self.config.delivered_memory {
            if let Some(oldest) = self.delivered_order.pop_front() {
                self.delivered.remove(&oldest);
            }
        }
        self.delivered.insert(batch_id.clone());
        self.delivered_order.push_back(batch_id);
    }
}

impl<T> std::fmt::Debug for BatchReassembler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchReassembler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
