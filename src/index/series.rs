//! Striped series index for one tenant
//!
//! Fingerprints are spread over a fixed number of stripes
//! (`fingerprint % stripes`), each behind its own `RwLock`. Appends to
//! different stripes never contend; appends to the same fingerprint are
//! serialized by that stripe's write lock.

use crate::index::context::QueryContext;
use crate::index::matcher::matches_all;
use crate::index::ChunkQuery;
use crate::storage::error::HeadResult;
use crate::storage::types::{ChunkMeta, ChunkRef, Fingerprint, LabelSet};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// One series: its labels and every chunk registered against it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemSeries {
    pub labels: LabelSet,
    pub chunks: Vec<ChunkMeta>,
}

type Stripe = RwLock<BTreeMap<Fingerprint, MemSeries>>;

/// Series scanned between cancellation checks
const CHECK_INTERVAL: usize = 256;

pub struct SeriesIndex {
    stripes: Box<[Stripe]>,
}

impl SeriesIndex {
    pub fn new(stripe_size: usize) -> Self {
        let stripes = (0..stripe_size.max(1))
            .map(|_| RwLock::new(BTreeMap::new()))
            .collect();
        Self { stripes }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    fn stripe(&self, fp: Fingerprint) -> &Stripe {
        &self.stripes[(fp % self.stripes.len() as u64) as usize]
    }

    /// Append chunks to a series, creating it on first sight.
    ///
    /// Returns true if the series was created. Labels of an existing series
    /// are never replaced.
    pub fn append(&self, labels: &LabelSet, fp: Fingerprint, chunks: &[ChunkMeta]) -> bool {
        let mut stripe = self.stripe(fp).write();
        match stripe.get_mut(&fp) {
            Some(series) => {
                series.chunks.extend_from_slice(chunks);
                false
            }
            None => {
                stripe.insert(
                    fp,
                    MemSeries {
                        labels: labels.clone(),
                        chunks: chunks.to_vec(),
                    },
                );
                true
            }
        }
    }

    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.stripe(fp).read().contains_key(&fp)
    }

    /// Visit every series, one stripe lock at a time
    pub fn for_each(&self, mut f: impl FnMut(Fingerprint, &MemSeries)) {
        for stripe in self.stripes.iter() {
            for (fp, series) in stripe.read().iter() {
                f(*fp, series);
            }
        }
    }

    /// (series, chunks)
    pub fn counts(&self) -> (usize, usize) {
        let mut series = 0;
        let mut chunks = 0;
        for stripe in self.stripes.iter() {
            let stripe = stripe.read();
            series += stripe.len();
            chunks += stripe.values().map(|s| s.chunks.len()).sum::<usize>();
        }
        (series, chunks)
    }

    /// Linear scan: every matching series, every chunk overlapping the range
    pub fn get_chunk_refs(
        &self,
        ctx: &QueryContext,
        query: &ChunkQuery<'_>,
        acc: &mut Vec<ChunkRef>,
    ) -> HeadResult<()> {
        for stripe in self.stripes.iter() {
            let stripe = stripe.read();
            for (i, (fp, series)) in stripe.iter().enumerate() {
                if i % CHECK_INTERVAL == 0 {
                    ctx.check()?;
                }
                if !matches_all(query.matchers, &series.labels) {
                    continue;
                }
                for chunk in &series.chunks {
                    if !chunk.overlaps(query.from, query.through) {
                        continue;
                    }
                    let chunk_ref = ChunkRef::from_meta(query.tenant, *fp, chunk);
                    if query.keeps(&chunk_ref) {
                        acc.push(chunk_ref);
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SeriesIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (series, chunks) = self.counts();
        f.debug_struct("SeriesIndex")
            .field("stripes", &self.stripes.len())
            .field("series", &series)
            .field("chunks", &chunks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Matcher;
    use crate::storage::error::HeadError;

    fn labels(s: &str) -> LabelSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_append_creates_then_extends() {
        let index = SeriesIndex::new(4);
        let ls = labels(r#"{foo="bar"}"#);

        assert!(index.append(&ls, 7, &[ChunkMeta::new(1, 10, 0)]));
        assert!(!index.append(&ls, 7, &[ChunkMeta::new(11, 20, 1)]));
        // Duplicate registration is kept
        assert!(!index.append(&ls, 7, &[ChunkMeta::new(11, 20, 1)]));

        assert!(index.contains(7));
        assert!(!index.contains(8));
        assert_eq!(index.counts(), (1, 3));
    }

    #[test]
    fn test_query_range_and_matchers() {
        let index = SeriesIndex::new(4);
        index.append(&labels(r#"{foo="bar"}"#), 1, &[ChunkMeta::new(1, 10, 0), ChunkMeta::new(50, 60, 1)]);
        index.append(&labels(r#"{foo="baz"}"#), 2, &[ChunkMeta::new(1, 10, 2)]);

        let matchers = [Matcher::equal("foo", "bar")];
        let query = ChunkQuery::new("t", 0, 20).matchers(&matchers);
        let mut acc = Vec::new();
        index.get_chunk_refs(&QueryContext::new(), &query, &mut acc).unwrap();
        assert_eq!(acc.len(), 1);
        assert_eq!((acc[0].fingerprint, acc[0].start, acc[0].end), (1, 1, 10));

        // Bounds are inclusive
        let query = ChunkQuery::new("t", 60, 100).matchers(&matchers);
        let mut acc = Vec::new();
        index.get_chunk_refs(&QueryContext::new(), &query, &mut acc).unwrap();
        assert_eq!(acc.len(), 1);
        assert_eq!(acc[0].checksum, 1);

        // No matchers selects every series
        let query = ChunkQuery::new("t", 0, 100);
        let mut acc = Vec::new();
        index.get_chunk_refs(&QueryContext::new(), &query, &mut acc).unwrap();
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn test_filter_vetoes_chunks() {
        let index = SeriesIndex::new(2);
        index.append(&labels(r#"{foo="bar"}"#), 1, &[ChunkMeta::new(1, 10, 0), ChunkMeta::new(11, 20, 1)]);

        let drop_checksum_0 = |c: &ChunkRef| c.checksum != 0;
        let query = ChunkQuery::new("t", 0, 100).filter(&drop_checksum_0);
        let mut acc = Vec::new();
        index.get_chunk_refs(&QueryContext::new(), &query, &mut acc).unwrap();
        assert_eq!(acc.len(), 1);
        assert_eq!(acc[0].checksum, 1);
    }

    #[test]
    fn test_cancelled_query_stops() {
        let index = SeriesIndex::new(2);
        index.append(&labels(r#"{foo="bar"}"#), 1, &[ChunkMeta::new(1, 10, 0)]);

        let ctx = QueryContext::new();
        ctx.cancel();
        let mut acc = Vec::new();
        let result = index.get_chunk_refs(&ctx, &ChunkQuery::new("t", 0, 100), &mut acc);
        assert!(result.is_err());
        assert!(acc.is_empty());
    }

    #[test]
    fn test_cancel_inside_one_stripe() {
        let index = SeriesIndex::new(1);
        let total = CHECK_INTERVAL * 4;
        for fp in 0..total as u64 {
            let ls = LabelSet::from_pairs([("i", fp.to_string())]);
            index.append(&ls, fp, &[ChunkMeta::new(1, 10, fp as u32)]);
        }

        // Cancel from within the scan, on the first chunk seen
        let ctx = QueryContext::new();
        let handle = ctx.clone();
        let cancel_on_first = move |_: &ChunkRef| {
            handle.cancel();
            true
        };
        let query = ChunkQuery::new("t", 0, 100).filter(&cancel_on_first);
        let mut acc = Vec::new();
        let result = index.get_chunk_refs(&ctx, &query, &mut acc);

        assert!(matches!(result, Err(HeadError::Cancelled)));
        assert_eq!(acc.len(), CHECK_INTERVAL);
    }
}
