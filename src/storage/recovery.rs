//! WAL replay into tenant heads
//!
//! Replays every segment of every WAL directory in order. Damage that a
//! crash mid-write can leave behind (a torn envelope, a checksum mismatch,
//! an implausible length) truncates that WAL directory at the damage: the
//! rest of the segment and every later segment of the directory are
//! skipped, and the whole cut counts as one repair. An intact envelope
//! whose payload cannot be decoded aborts recovery: truncating it away
//! could drop committed data.

use crate::index::TenantHeads;
use crate::storage::error::{HeadError, HeadResult};
use crate::storage::layout::WalIdentifier;
use crate::storage::record::WalRecord;
use crate::storage::types::{Fingerprint, LabelSet};
use crate::storage::wal::{list_segments, Envelope, SegmentReader};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Repair tail damage silently (apart from logs and counters)
    #[default]
    Lenient,
    /// Repair tail damage and list every repair in the report
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageKind {
    Torn,
    ChecksumMismatch,
    Malformed,
}

impl fmt::Display for DamageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DamageKind::Torn => write!(f, "torn record"),
            DamageKind::ChecksumMismatch => write!(f, "checksum mismatch"),
            DamageKind::Malformed => write!(f, "malformed envelope"),
        }
    }
}

/// One repaired segment tail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailDamage {
    pub path: PathBuf,
    pub offset: u64,
    pub kind: DamageKind,
}

/// Outcome of a successful replay
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub wals: usize,
    pub segments: usize,
    /// Segments dropped because an earlier segment of their WAL was damaged
    pub skipped_segments: usize,
    pub records: u64,
    pub chunk_metas: u64,
    /// Tail repairs, counted in every mode
    pub repairs: u64,
    /// Repair details, only collected in strict mode
    pub damage: Vec<TailDamage>,
}

impl RecoveryReport {
    /// True if no segment needed a repair
    pub fn is_clean(&self) -> bool {
        self.repairs == 0
    }
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "WALs:        {}", self.wals)?;
        writeln!(f, "Segments:    {}", self.segments)?;
        writeln!(f, "Skipped:     {}", self.skipped_segments)?;
        writeln!(f, "Records:     {}", self.records)?;
        writeln!(f, "Chunk metas: {}", self.chunk_metas)?;
        writeln!(f, "Repairs:     {}", self.repairs)?;
        for damage in &self.damage {
            writeln!(
                f,
                "  {:?} at offset {}: {}",
                damage.path, damage.offset, damage.kind
            )?;
        }
        Ok(())
    }
}

/// Replay `wals` (oldest first) into `heads`
pub fn recover_head(
    wals: &[WalIdentifier],
    heads: &TenantHeads,
    mode: RecoveryMode,
) -> HeadResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut series: HashMap<(String, Fingerprint), LabelSet> = HashMap::new();

    for wal in wals {
        report.wals += 1;
        let segments = list_segments(&wal.path)?;
        for (i, (_, segment)) in segments.iter().enumerate() {
            report.segments += 1;
            let Some((offset, kind)) = replay_segment(segment, heads, &mut series, &mut report)?
            else {
                continue;
            };

            let skipped = segments.len() - i - 1;
            tracing::warn!(
                "Repairing WAL {:?}: {} in segment {:?} at offset {}, dropping the rest of the WAL ({} later segments)",
                wal.path,
                kind,
                segment,
                offset,
                skipped
            );
            report.repairs += 1;
            report.skipped_segments += skipped;
            if mode == RecoveryMode::Strict {
                report.damage.push(TailDamage {
                    path: segment.clone(),
                    offset,
                    kind,
                });
            }
            break;
        }
    }

    tracing::debug!(
        "Recovered {} records ({} chunk metas) from {} WAL directories",
        report.records,
        report.chunk_metas,
        report.wals
    );
    Ok(report)
}

/// Replay one segment; returns where and how it is damaged, if it is
fn replay_segment(
    path: &Path,
    heads: &TenantHeads,
    series: &mut HashMap<(String, Fingerprint), LabelSet>,
    report: &mut RecoveryReport,
) -> HeadResult<Option<(u64, DamageKind)>> {
    let mut reader = SegmentReader::open(path)?;

    loop {
        let damage = match reader.next_envelope()? {
            Envelope::Record { offset, payload } => {
                let record =
                    WalRecord::decode(&payload).map_err(|source| HeadError::UndecodableRecord {
                        path: path.to_path_buf(),
                        offset,
                        source,
                    })?;
                apply(record, heads, series, report)?;
                continue;
            }
            Envelope::End => return Ok(None),
            Envelope::Torn { offset } => (offset, DamageKind::Torn),
            Envelope::ChecksumMismatch { offset } => (offset, DamageKind::ChecksumMismatch),
            Envelope::Malformed { offset, .. } => (offset, DamageKind::Malformed),
        };
        return Ok(Some(damage));
    }
}

fn apply(
    record: WalRecord,
    heads: &TenantHeads,
    series: &mut HashMap<(String, Fingerprint), LabelSet>,
    report: &mut RecoveryReport,
) -> HeadResult<()> {
    report.records += 1;
    match record {
        WalRecord::Series(r) => {
            series.insert((r.tenant, r.fingerprint), r.labels);
        }
        WalRecord::ChunkMetas(r) => {
            let labels = series
                .get(&(r.tenant.clone(), r.fingerprint))
                .ok_or_else(|| HeadError::OrphanChunkMetas {
                    tenant: r.tenant.clone(),
                    fingerprint: r.fingerprint,
                })?;
            heads.append(&r.tenant, labels, r.fingerprint, &r.chunks);
            report.chunk_metas += r.chunks.len() as u64;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ChunkIndex, ChunkQuery, QueryContext};
    use crate::storage::layout::list_wals;
    use crate::storage::types::{ChunkMeta, ChunkRef};
    use crate::storage::wal::{segment_name, HeadWal, WalOptions};
    use chrono::{TimeZone, Utc};
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    struct Case {
        tenant: &'static str,
        labels: &'static str,
        fp: Fingerprint,
        chunks: Vec<ChunkMeta>,
    }

    fn cases() -> Vec<Case> {
        vec![
            Case {
                tenant: "tenant1",
                labels: r#"{foo="bar", bazz="buzz"}"#,
                fp: 1,
                chunks: vec![ChunkMeta::new(1, 10, 3)],
            },
            Case {
                tenant: "tenant1",
                labels: r#"{foo="bard", bazz="bozz", bonk="borb"}"#,
                fp: 2,
                chunks: vec![ChunkMeta::new(1, 7, 4), ChunkMeta::new(8, 12, 5)],
            },
            Case {
                tenant: "tenant2",
                labels: r#"{foo="bard", bazz="bozz", bonk="borb"}"#,
                fp: 1,
                chunks: vec![ChunkMeta::new(1, 7, 4)],
            },
        ]
    }

    fn query(heads: &TenantHeads, tenant: &str) -> Vec<ChunkRef> {
        let mut acc = Vec::new();
        heads
            .get_chunk_refs(&QueryContext::new(), &ChunkQuery::new(tenant, 0, i64::MAX), &mut acc)
            .unwrap();
        acc
    }

    fn write_cases(wal: &HeadWal) {
        for case in cases() {
            let labels: LabelSet = case.labels.parse().unwrap();
            wal.log_all(&[
                WalRecord::series(case.tenant, case.fp, &labels),
                WalRecord::chunk_metas(case.tenant, case.fp, &case.chunks),
            ])
            .unwrap();
        }
    }

    fn wal_ids(dir: &Path) -> Vec<WalIdentifier> {
        list_wals(dir).unwrap()
    }

    #[test]
    fn test_recover_matches_direct_appends() {
        let dir = tempdir().unwrap();
        let wal = HeadWal::open(dir.path().join("100"), Utc::now(), WalOptions::default()).unwrap();
        write_cases(&wal);
        wal.stop().unwrap();

        let direct = TenantHeads::new(Utc::now(), 4);
        for case in cases() {
            direct.append(case.tenant, &case.labels.parse().unwrap(), case.fp, &case.chunks);
        }

        let recovered = TenantHeads::new(Utc::now(), 4);
        let report = recover_head(&wal_ids(dir.path()), &recovered, RecoveryMode::Strict).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.records, 6);
        assert_eq!(report.chunk_metas, 4);

        for tenant in ["tenant1", "tenant2"] {
            assert_eq!(query(&recovered, tenant), query(&direct, tenant));
        }
        assert_eq!(recovered.stats(), direct.stats());
    }

    #[test]
    fn test_torn_tail_is_repaired() {
        let dir = tempdir().unwrap();
        let wal = HeadWal::open(dir.path().join("100"), Utc::now(), WalOptions::default()).unwrap();
        let ls: LabelSet = r#"{foo="bar"}"#.parse().unwrap();
        wal.log(&WalRecord::series("tenant1", 1, &ls)).unwrap();
        for i in 0..100 {
            wal.log(&WalRecord::chunk_metas("tenant1", 1, &[ChunkMeta::new(i, i + 1, i as u32)]))
                .unwrap();
        }
        wal.stop().unwrap();

        // Cut the last record in half
        let segment = dir.path().join("100").join(segment_name(0));
        let len = std::fs::metadata(&segment).unwrap().len();
        OpenOptions::new().write(true).open(&segment).unwrap().set_len(len - 10).unwrap();

        let heads = TenantHeads::new(Utc::now(), 4);
        let report = recover_head(&wal_ids(dir.path()), &heads, RecoveryMode::Lenient).unwrap();
        assert_eq!(report.repairs, 1);
        assert!(report.damage.is_empty(), "lenient mode keeps no details");
        assert_eq!(query(&heads, "tenant1").len(), 99);
    }

    #[test]
    fn test_strict_mode_reports_damage() {
        let dir = tempdir().unwrap();
        let wal = HeadWal::open(dir.path().join("100"), Utc::now(), WalOptions::default()).unwrap();
        write_cases(&wal);
        wal.stop().unwrap();

        let segment = dir.path().join("100").join(segment_name(0));
        OpenOptions::new().write(true).open(&segment).unwrap().set_len(10).unwrap();

        let heads = TenantHeads::new(Utc::now(), 4);
        let report = recover_head(&wal_ids(dir.path()), &heads, RecoveryMode::Strict).unwrap();
        assert!(!report.is_clean());
        assert_eq!(
            report.damage,
            vec![TailDamage {
                path: segment,
                offset: 0,
                kind: DamageKind::Torn,
            }]
        );
        assert!(heads.is_empty());
    }

    #[test]
    fn test_damage_drops_rest_of_wal_dir() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("100");
        let ls: LabelSet = r#"{foo="bar"}"#.parse().unwrap();

        let first = HeadWal::open(&wal_dir, Utc::now(), WalOptions::default()).unwrap();
        first.log(&WalRecord::series("tenant1", 1, &ls)).unwrap();
        first.log(&WalRecord::chunk_metas("tenant1", 1, &[ChunkMeta::new(1, 2, 1)])).unwrap();
        first.log(&WalRecord::chunk_metas("tenant1", 1, &[ChunkMeta::new(3, 4, 2)])).unwrap();
        first.stop().unwrap();

        // Second writer on the same directory lands in the next segment
        let second = HeadWal::open(&wal_dir, Utc::now(), WalOptions::default()).unwrap();
        second.log(&WalRecord::chunk_metas("tenant1", 1, &[ChunkMeta::new(5, 6, 3)])).unwrap();
        second.stop().unwrap();

        // A later directory is replayed as usual
        let later = HeadWal::open(dir.path().join("200"), Utc::now(), WalOptions::default()).unwrap();
        later.log(&WalRecord::series("tenant1", 1, &ls)).unwrap();
        later.log(&WalRecord::chunk_metas("tenant1", 1, &[ChunkMeta::new(7, 8, 4)])).unwrap();
        later.stop().unwrap();

        let segment = wal_dir.join(segment_name(0));
        let len = std::fs::metadata(&segment).unwrap().len();
        OpenOptions::new().write(true).open(&segment).unwrap().set_len(len - 1).unwrap();

        let heads = TenantHeads::new(Utc::now(), 4);
        let report = recover_head(&wal_ids(dir.path()), &heads, RecoveryMode::Lenient).unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(report.skipped_segments, 1);
        assert_eq!(report.repairs, 1);

        let checksums: Vec<u32> = query(&heads, "tenant1").iter().map(|r| r.checksum).collect();
        assert_eq!(checksums, vec![1, 4]);
    }

    #[test]
    fn test_mid_wal_checksum_mismatch_is_repaired() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("100");
        let options = WalOptions {
            segment_size: 200,
            ..WalOptions::default()
        };
        let ls: LabelSet = r#"{foo="bar"}"#.parse().unwrap();

        // The series is defined once; later segments only carry chunk metas
        let wal = HeadWal::open(&wal_dir, Utc::now(), options).unwrap();
        wal.log(&WalRecord::series("t", 1, &ls)).unwrap();
        for i in 0..12 {
            wal.log(&WalRecord::chunk_metas("t", 1, &[ChunkMeta::new(i, i + 1, i as u32)]))
                .unwrap();
        }
        wal.stop().unwrap();

        let segments = list_segments(&wal_dir).unwrap();
        assert!(segments.len() > 2);

        // Flip a payload byte of the first record in segment 0
        let segment = wal_dir.join(segment_name(0));
        let mut bytes = std::fs::read(&segment).unwrap();
        bytes[5] ^= 0xFF;
        std::fs::write(&segment, &bytes).unwrap();

        let heads = TenantHeads::new(Utc::now(), 4);
        let report = recover_head(&wal_ids(dir.path()), &heads, RecoveryMode::Strict).unwrap();
        assert_eq!(report.repairs, 1);
        assert_eq!(report.records, 0);
        assert_eq!(report.skipped_segments, segments.len() - 1);
        assert_eq!(
            report.damage,
            vec![TailDamage {
                path: segment,
                offset: 0,
                kind: DamageKind::ChecksumMismatch,
            }]
        );
        assert!(heads.is_empty());
    }

    #[test]
    fn test_checksum_mismatch_in_last_record_is_repaired() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("100");
        let ls: LabelSet = r#"{foo="bar"}"#.parse().unwrap();

        let wal = HeadWal::open(&wal_dir, Utc::now(), WalOptions::default()).unwrap();
        wal.log(&WalRecord::series("tenant1", 1, &ls)).unwrap();
        let mut last = Vec::new();
        for i in 0..4 {
            let record = WalRecord::chunk_metas("tenant1", 1, &[ChunkMeta::new(i, i + 1, i as u32)]);
            wal.log(&record).unwrap();
            last.clear();
            record.encode(&mut last).unwrap();
        }
        wal.stop().unwrap();

        // Keep the length intact, corrupt a byte inside the last payload
        let segment = wal_dir.join(segment_name(0));
        let mut bytes = std::fs::read(&segment).unwrap();
        let last_offset = bytes.len() - (last.len() + 8);
        bytes[last_offset + 4 + last.len() / 2] ^= 0xFF;
        std::fs::write(&segment, &bytes).unwrap();

        for mode in [RecoveryMode::Lenient, RecoveryMode::Strict] {
            let heads = TenantHeads::new(Utc::now(), 4);
            let report = recover_head(&wal_ids(dir.path()), &heads, mode).unwrap();
            assert_eq!(report.repairs, 1);
            assert_eq!(report.records, 4);
            assert_eq!(query(&heads, "tenant1").len(), 3);

            if mode == RecoveryMode::Strict {
                assert_eq!(report.damage.len(), 1);
                assert_eq!(report.damage[0].offset, last_offset as u64);
                assert_eq!(report.damage[0].kind, DamageKind::ChecksumMismatch);
            }
        }
    }

    #[test]
    fn test_undecodable_payload_fails() {
        let dir = tempdir().unwrap();
        let wal = HeadWal::open(dir.path().join("100"), Utc::now(), WalOptions::default()).unwrap();
        wal.log_bytes(b"not a valid WAL record").unwrap();
        wal.stop().unwrap();

        for mode in [RecoveryMode::Lenient, RecoveryMode::Strict] {
            let heads = TenantHeads::new(Utc::now(), 4);
            let err = recover_head(&wal_ids(dir.path()), &heads, mode).unwrap_err();
            assert!(matches!(err, HeadError::UndecodableRecord { offset: 0, .. }));
        }
    }

    #[test]
    fn test_orphan_chunk_metas_fail() {
        let dir = tempdir().unwrap();
        let wal = HeadWal::open(dir.path().join("100"), Utc::now(), WalOptions::default()).unwrap();
        wal.log(&WalRecord::chunk_metas("tenant1", 9, &[ChunkMeta::new(1, 2, 0)]))
            .unwrap();
        wal.stop().unwrap();

        let heads = TenantHeads::new(Utc::now(), 4);
        let err = recover_head(&wal_ids(dir.path()), &heads, RecoveryMode::Lenient).unwrap_err();
        assert!(matches!(
            err,
            HeadError::OrphanChunkMetas { fingerprint: 9, .. }
        ));
    }

    #[test]
    fn test_series_defined_in_earlier_wal() {
        let dir = tempdir().unwrap();
        let ls: LabelSet = r#"{foo="bar"}"#.parse().unwrap();

        let older = HeadWal::open(dir.path().join("100"), Utc.timestamp_opt(100, 0).unwrap(), WalOptions::default()).unwrap();
        older.log(&WalRecord::series("tenant1", 1, &ls)).unwrap();
        older.stop().unwrap();

        let newer = HeadWal::open(dir.path().join("200"), Utc.timestamp_opt(200, 0).unwrap(), WalOptions::default()).unwrap();
        newer.log(&WalRecord::chunk_metas("tenant1", 1, &[ChunkMeta::new(1, 2, 7)])).unwrap();
        newer.stop().unwrap();

        let heads = TenantHeads::new(Utc::now(), 4);
        let report = recover_head(&wal_ids(dir.path()), &heads, RecoveryMode::Lenient).unwrap();
        assert_eq!(report.wals, 2);
        assert_eq!(query(&heads, "tenant1")[0].checksum, 7);
    }
}
