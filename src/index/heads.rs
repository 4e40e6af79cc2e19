//! Tenant heads: every tenant's series index for one rotation period

use crate::index::context::QueryContext;
use crate::index::series::SeriesIndex;
use crate::index::{ChunkIndex, ChunkQuery};
use crate::storage::error::HeadResult;
use crate::storage::types::{ChunkMeta, ChunkRef, Fingerprint, LabelSet};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_STRIPE_SIZE: usize = 128;

/// In-memory state of one period
///
/// The tenant map has its own lock; it is only written when a tenant
/// appears for the first time.
pub struct TenantHeads {
    start: DateTime<Utc>,
    stripe_size: usize,
    tenants: RwLock<HashMap<String, Arc<SeriesIndex>>>,
}

impl TenantHeads {
    pub fn new(start: DateTime<Utc>, stripe_size: usize) -> Self {
        Self {
            start,
            stripe_size,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Time this head was created (its period start for rotated heads)
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn stripe_size(&self) -> usize {
        self.stripe_size
    }

    fn tenant(&self, tenant: &str) -> Option<Arc<SeriesIndex>> {
        self.tenants.read().get(tenant).cloned()
    }

    fn tenant_or_create(&self, tenant: &str) -> Arc<SeriesIndex> {
        if let Some(index) = self.tenant(tenant) {
            return index;
        }
        self.tenants
            .write()
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(SeriesIndex::new(self.stripe_size)))
            .clone()
    }

    /// Register chunks for a series; returns true if the series is new
    pub fn append(
        &self,
        tenant: &str,
        labels: &LabelSet,
        fp: Fingerprint,
        chunks: &[ChunkMeta],
    ) -> bool {
        self.tenant_or_create(tenant).append(labels, fp, chunks)
    }

    pub fn has_series(&self, tenant: &str, fp: Fingerprint) -> bool {
        self.tenant(tenant).is_some_and(|index| index.contains(fp))
    }

    /// Tenant IDs, sorted
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.tenants.read().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Visit every series of every tenant, tenants in sorted order
    pub fn for_each_series(&self, mut f: impl FnMut(&str, &LabelSet, Fingerprint, &[ChunkMeta])) {
        for tenant in self.tenants() {
            if let Some(index) = self.tenant(&tenant) {
                index.for_each(|fp, series| f(&tenant, &series.labels, fp, &series.chunks));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.read().is_empty()
    }

    pub fn stats(&self) -> HeadStats {
        let indexes: Vec<Arc<SeriesIndex>> = self.tenants.read().values().cloned().collect();
        let mut stats = HeadStats {
            tenants: indexes.len(),
            ..HeadStats::default()
        };
        for index in indexes {
            let (series, chunks) = index.counts();
            stats.series += series;
            stats.chunks += chunks;
        }
        stats
    }
}

impl ChunkIndex for TenantHeads {
    fn get_chunk_refs(
        &self,
        ctx: &QueryContext,
        query: &ChunkQuery<'_>,
        acc: &mut Vec<ChunkRef>,
    ) -> HeadResult<()> {
        match self.tenant(query.tenant) {
            Some(index) => index.get_chunk_refs(ctx, query, acc),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for TenantHeads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantHeads")
            .field("start", &self.start)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Size of a head
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadStats {
    pub tenants: usize,
    pub series: usize,
    pub chunks: usize,
}

impl fmt::Display for HeadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tenants, {} series, {} chunks",
            self.tenants, self.series, self.chunks
        )
    }
}
