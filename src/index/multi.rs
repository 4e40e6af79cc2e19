//! Fan-out over several chunk indexes

use crate::index::context::QueryContext;
use crate::index::{ChunkIndex, ChunkQuery};
use crate::storage::error::HeadResult;
use crate::storage::types::ChunkRef;
use std::sync::Arc;

/// Concatenates the answers of its sources in source order.
///
/// Refs are not de-duplicated: a chunk claimed by two sources is returned
/// twice.
#[derive(Clone, Default)]
pub struct MultiIndex {
    sources: Vec<Arc<dyn ChunkIndex>>,
}

impl MultiIndex {
    pub fn new(sources: Vec<Arc<dyn ChunkIndex>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ChunkIndex for MultiIndex {
    fn get_chunk_refs(
        &self,
        ctx: &QueryContext,
        query: &ChunkQuery<'_>,
        acc: &mut Vec<ChunkRef>,
    ) -> HeadResult<()> {
        for source in &self.sources {
            ctx.check()?;
            source.get_chunk_refs(ctx, query, acc)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MultiIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiIndex")
            .field("sources", &self.sources.len())
            .finish()
    }
}
