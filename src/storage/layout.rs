//! On-disk layout of a head store
//!
//! ```text
//! <root>/<name>/scratch/
//! <root>/<name>/wal/<unix-secs>/00000000 ...
//! <root>/<name>/multitenant/
//! <root>/<name>/per_tenant/
//! <root>/wal/<unix-secs>/          (legacy, pre-rotation)
//! ```

use crate::storage::error::HeadResult;
use chrono::{DateTime, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rotation period length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period(Duration);

impl Period {
    pub const DEFAULT: Period = Period(Duration::from_secs(15 * 60));

    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    fn millis(&self) -> i64 {
        (self.0.as_millis() as i64).max(1)
    }

    /// Period number containing `t`
    pub fn period_for(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp_millis().div_euclid(self.millis())
    }

    /// Start of period `n`
    pub fn time_for_period(&self, n: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(n.saturating_mul(self.millis()))
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for Period {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One WAL directory, named by the Unix second it was opened at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalIdentifier {
    pub ts: DateTime<Utc>,
    pub path: PathBuf,
}

/// WAL directories whose timestamps fall into the same period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalGroup {
    pub period: i64,
    pub wals: Vec<WalIdentifier>,
}

/// Path resolution for one named store under a root directory
#[derive(Debug, Clone)]
pub struct StoreLayout {
    name: String,
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.store_dir().join("scratch")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.store_dir().join("wal")
    }

    pub fn multitenant_dir(&self) -> PathBuf {
        self.store_dir().join("multitenant")
    }

    pub fn per_tenant_dir(&self) -> PathBuf {
        self.store_dir().join("per_tenant")
    }

    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.scratch_dir(),
            self.wal_dir(),
            self.multitenant_dir(),
            self.per_tenant_dir(),
        ]
    }

    /// Create all required directories
    pub fn ensure_dirs(&self) -> HeadResult<()> {
        for dir in self.required_dirs() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// WAL directory for a head opened at `t`
    pub fn wal_path(&self, t: DateTime<Utc>) -> PathBuf {
        self.wal_dir().join(t.timestamp().to_string())
    }

    pub fn legacy_wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    pub fn legacy_wal_path(&self, t: DateTime<Utc>) -> PathBuf {
        self.legacy_wal_dir().join(t.timestamp().to_string())
    }
}

/// All WAL directories under `dir`, oldest first
pub fn list_wals(dir: &Path) -> HeadResult<Vec<WalIdentifier>> {
    let mut wals = Vec::new();
    if !dir.exists() {
        return Ok(wals);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let ts = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        match ts {
            Some(ts) if path.is_dir() => wals.push(WalIdentifier { ts, path }),
            _ => tracing::warn!("Skipping unexpected entry in WAL directory: {:?}", path),
        }
    }

    wals.sort_by_key(|w| w.ts);
    Ok(wals)
}

/// WAL directories under `dir` grouped by period, oldest period first
pub fn wal_groups(dir: &Path, period: Period) -> HeadResult<Vec<WalGroup>> {
    let mut groups: Vec<WalGroup> = Vec::new();
    for wal in list_wals(dir)? {
        let n = period.period_for(wal.ts);
        match groups.last_mut() {
            Some(group) if group.period == n => group.wals.push(wal),
            _ => groups.push(WalGroup {
                period: n,
                wals: vec![wal],
            }),
        }
    }
    Ok(groups)
}

/// The WAL group for period `n`, if any directory falls into it
pub fn wals_for_period(dir: &Path, period: Period, n: i64) -> HeadResult<Option<WalGroup>> {
    Ok(wal_groups(dir, period)?.into_iter().find(|g| g.period == n))
}

/// Legacy WAL directories under `<root>/wal`
pub fn legacy_wals(layout: &StoreLayout) -> HeadResult<Vec<WalIdentifier>> {
    list_wals(&layout.legacy_wal_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_period_math() {
        let period = Period::new(Duration::from_secs(60));
        let t = Utc.timestamp_opt(125, 0).unwrap();

        assert_eq!(period.period_for(t), 2);
        assert_eq!(period.time_for_period(2), Utc.timestamp_opt(120, 0).unwrap());
        assert_eq!(
            period.period_for(period.time_for_period(7)),
            7,
            "period start belongs to its own period"
        );
    }

    #[test]
    fn test_layout_paths() {
        let layout = StoreLayout::new("index", "/data");
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert_eq!(layout.wal_path(t), PathBuf::from("/data/index/wal/1700000000"));
        assert_eq!(layout.legacy_wal_path(t), PathBuf::from("/data/wal/1700000000"));
        assert_eq!(layout.scratch_dir(), PathBuf::from("/data/index/scratch"));
        assert_eq!(layout.required_dirs().len(), 4);
    }

    #[test]
    fn test_wal_groups() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new("index", dir.path());
        layout.ensure_dirs().unwrap();

        let period = Period::new(Duration::from_secs(100));
        for secs in [1_000, 1_050, 1_150, 1_420] {
            std::fs::create_dir_all(layout.wal_path(Utc.timestamp_opt(secs, 0).unwrap())).unwrap();
        }
        std::fs::create_dir_all(layout.wal_dir().join("not-a-timestamp")).unwrap();

        let groups = wal_groups(&layout.wal_dir(), period).unwrap();
        let summary: Vec<(i64, usize)> = groups.iter().map(|g| (g.period, g.wals.len())).collect();
        assert_eq!(summary, vec![(10, 2), (11, 1), (14, 1)]);

        let group = wals_for_period(&layout.wal_dir(), period, 10).unwrap().unwrap();
        assert_eq!(group.wals[0].ts.timestamp(), 1_000);
        assert_eq!(group.wals[1].ts.timestamp(), 1_050);
        assert!(wals_for_period(&layout.wal_dir(), period, 12).unwrap().is_none());
    }

    #[test]
    fn test_missing_dirs_are_empty() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new("index", dir.path());

        assert!(legacy_wals(&layout).unwrap().is_empty());
        assert!(wal_groups(&layout.wal_dir(), Period::DEFAULT).unwrap().is_empty());
    }
}
