//! Durable builder collaborator
//!
//! The head manager never knows how a finished period is persisted; it only
//! hands heads and WAL groups to an `IndexBuilder`.

use crate::index::{ChunkIndex, ChunkQuery, MultiIndex, QueryContext, TenantHeads};
use crate::storage::error::HeadResult;
use crate::storage::layout::{WalGroup, WalIdentifier};
use crate::storage::recovery::{recover_head, RecoveryMode};
use crate::storage::types::ChunkRef;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub trait IndexBuilder: Send + Sync {
    /// Commit a finished period's head
    fn build_from_head(&self, heads: &Arc<TenantHeads>) -> HeadResult<()>;

    /// Rebuild and commit a period from its WAL directories.
    ///
    /// `legacy` WALs predate rotation and may hold data for any period.
    fn build_from_wals(
        &self,
        cutoff: DateTime<Utc>,
        wals: &[WalIdentifier],
        legacy: bool,
    ) -> HeadResult<()>;

    /// Called once after startup catch-up
    fn start(&self) -> HeadResult<()>;

    /// Whether a WAL group was already built in an earlier lifetime
    fn is_built(&self, _group: &WalGroup) -> bool {
        false
    }
}

/// Builder that keeps built periods in memory
///
/// Chunks are attributed to every schema period their time range overlaps.
/// Schema periods are delimited by `boundaries` (Unix ms, ascending): with
/// boundaries `[b1, b2]` the periods are `(.., b1)`, `[b1, b2)` and `[b2, ..)`.
pub struct MemoryBuilder {
    stripe_size: usize,
    boundaries: Vec<i64>,
    built: RwLock<BTreeMap<usize, Vec<Arc<TenantHeads>>>>,
    builds: AtomicU64,
    started: AtomicBool,
}

impl MemoryBuilder {
    pub fn new(stripe_size: usize) -> Self {
        Self::with_boundaries(stripe_size, Vec::new())
    }

    pub fn with_boundaries(stripe_size: usize, mut boundaries: Vec<i64>) -> Self {
        boundaries.sort_unstable();
        boundaries.dedup();
        Self {
            stripe_size,
            boundaries,
            built: RwLock::new(BTreeMap::new()),
            builds: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub fn schema_periods(&self) -> usize {
        self.boundaries.len() + 1
    }

    /// Inclusive ms range of schema period `i`
    fn period_range(&self, i: usize) -> (i64, i64) {
        let from = if i == 0 { i64::MIN } else { self.boundaries[i - 1] };
        let through = self
            .boundaries
            .get(i)
            .map_or(i64::MAX, |b| b.saturating_sub(1));
        (from, through)
    }

    /// Everything built into schema period `i`
    pub fn period_index(&self, i: usize) -> MultiIndex {
        let sources: Vec<Arc<dyn ChunkIndex>> = self
            .built
            .read()
            .get(&i)
            .map(|heads| {
                heads
                    .iter()
                    .map(|h| Arc::clone(h) as Arc<dyn ChunkIndex>)
                    .collect()
            })
            .unwrap_or_default();
        MultiIndex::new(sources)
    }

    /// Number of successful builds
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Split a head by schema period and keep the non-empty parts
    fn commit(&self, heads: &TenantHeads) {
        let mut parts: BTreeMap<usize, TenantHeads> = BTreeMap::new();

        heads.for_each_series(|tenant, labels, fp, chunks| {
            for i in 0..self.schema_periods() {
                let (from, through) = self.period_range(i);
                let owned: Vec<_> = chunks
                    .iter()
                    .filter(|c| c.overlaps(from, through))
                    .copied()
                    .collect();
                if owned.is_empty() {
                    continue;
                }
                parts
                    .entry(i)
                    .or_insert_with(|| TenantHeads::new(heads.start(), self.stripe_size))
                    .append(tenant, labels, fp, &owned);
            }
        });

        let mut built = self.built.write();
        for (i, part) in parts {
            built.entry(i).or_default().push(Arc::new(part));
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
    }
}

impl IndexBuilder for MemoryBuilder {
    fn build_from_head(&self, heads: &Arc<TenantHeads>) -> HeadResult<()> {
        self.commit(heads);
        tracing::debug!("Built head started at {} ({})", heads.start(), heads.stats());
        Ok(())
    }

    fn build_from_wals(
        &self,
        cutoff: DateTime<Utc>,
        wals: &[WalIdentifier],
        legacy: bool,
    ) -> HeadResult<()> {
        let heads = TenantHeads::new(cutoff, self.stripe_size);
        let report = recover_head(wals, &heads, RecoveryMode::Lenient)?;
        self.commit(&heads);
        tracing::debug!(
            "Built {} WAL directories (legacy: {}, cutoff {}): {} records",
            report.wals,
            legacy,
            cutoff,
            report.records
        );
        Ok(())
    }

    fn start(&self) -> HeadResult<()> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }
}

impl ChunkIndex for MemoryBuilder {
    fn get_chunk_refs(
        &self,
        ctx: &QueryContext,
        query: &ChunkQuery<'_>,
        acc: &mut Vec<ChunkRef>,
    ) -> HeadResult<()> {
        let heads: Vec<Arc<TenantHeads>> = self.built.read().values().flatten().cloned().collect();
        for head in heads {
            ctx.check()?;
            head.get_chunk_refs(ctx, query, acc)?;
        }
        Ok(())
    }
}
