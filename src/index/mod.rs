//! Head index structures
//!
//! - **SeriesIndex**: one tenant's series, striped by fingerprint
//! - **TenantHeads**: all tenants' series for one rotation period
//! - **MultiIndex**: ordered fan-out over several chunk indexes
//!
//! # Query Path
//!
//! ```text
//! ChunkQuery{tenant, [from, through], matchers, filter}
//!        ↓
//! MultiIndex → pending head, active head, built periods ...
//!        ↓
//! SeriesIndex: per stripe, match labels → intersect chunks → filter
//!        ↓
//! Vec<ChunkRef>
//! ```

mod context;
mod heads;
mod matcher;
mod multi;
mod series;

pub use context::QueryContext;
pub use heads::{HeadStats, TenantHeads, DEFAULT_STRIPE_SIZE};
pub use matcher::{matches_all, MatchType, Matcher};
pub use multi::MultiIndex;
pub use series::{MemSeries, SeriesIndex};

use crate::storage::error::HeadResult;
use crate::storage::types::ChunkRef;

/// Per-chunk veto applied after range intersection
pub type ChunkFilter = dyn Fn(&ChunkRef) -> bool + Send + Sync;

/// One chunk lookup: tenant, inclusive time range, matchers, optional filter
#[derive(Clone, Copy)]
pub struct ChunkQuery<'a> {
    pub tenant: &'a str,
    pub from: i64,
    pub through: i64,
    pub matchers: &'a [Matcher],
    pub filter: Option<&'a ChunkFilter>,
}

impl<'a> ChunkQuery<'a> {
    pub fn new(tenant: &'a str, from: i64, through: i64) -> Self {
        Self {
            tenant,
            from,
            through,
            matchers: &[],
            filter: None,
        }
    }

    /// Builder method: set label matchers
    pub fn matchers(mut self, matchers: &'a [Matcher]) -> Self {
        self.matchers = matchers;
        self
    }

    /// Builder method: set chunk filter
    pub fn filter(mut self, filter: &'a ChunkFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether the chunk filter (if any) keeps `chunk`
    pub fn keeps(&self, chunk: &ChunkRef) -> bool {
        self.filter.map_or(true, |f| f(chunk))
    }
}

impl std::fmt::Debug for ChunkQuery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkQuery")
            .field("tenant", &self.tenant)
            .field("from", &self.from)
            .field("through", &self.through)
            .field("matchers", &self.matchers)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Anything that can answer chunk lookups
///
/// Results are appended to `acc`; existing contents are left alone.
pub trait ChunkIndex: Send + Sync {
    fn get_chunk_refs(
        &self,
        ctx: &QueryContext,
        query: &ChunkQuery<'_>,
        acc: &mut Vec<ChunkRef>,
    ) -> HeadResult<()>;
}
