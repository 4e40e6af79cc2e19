//! Head Manager
//!
//! Owns the active head and its WAL, rotates them on period boundaries and
//! hands finished heads to the builder.
//!
//! # Rotation
//!
//! ```text
//! active(P) ──tick, period(now) > P──► open WAL(now), new head
//!                                      swap under exclusive guard
//!                                      old head → pending, stop old WAL
//!                                      build pending ──ok──► drop pending, remove period WALs
//!                                                    └─err─► keep pending, retry next tick
//! ```
//!
//! While a pending build keeps failing the active head is not rotated again,
//! so at most one finished head is ever held in memory.

use crate::index::{ChunkIndex, ChunkQuery, HeadStats, QueryContext, TenantHeads, DEFAULT_STRIPE_SIZE};
use crate::manager::builder::IndexBuilder;
use crate::storage::error::{HeadError, HeadResult};
use crate::storage::layout::{legacy_wals, wal_groups, Period, StoreLayout, WalIdentifier};
use crate::storage::record::WalRecord;
use crate::storage::types::{ChunkMeta, ChunkRef, Fingerprint, LabelSet};
use crate::storage::wal::{HeadWal, WalOptions};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

/// Head manager tuning
#[derive(Debug, Clone, Copy)]
pub struct HeadManagerOptions {
    pub period: Period,
    pub stripe_size: usize,
    pub wal: WalOptions,
}

impl Default for HeadManagerOptions {
    fn default() -> Self {
        Self {
            period: Period::DEFAULT,
            stripe_size: DEFAULT_STRIPE_SIZE,
            wal: WalOptions::default(),
        }
    }
}

/// The writable head and the WAL backing it
struct ActiveHead {
    heads: Arc<TenantHeads>,
    wal: HeadWal,
}

#[derive(Debug, Default)]
struct HeadMetrics {
    rotations: AtomicU64,
    rotation_failures: AtomicU64,
    builds: AtomicU64,
    records_logged: AtomicU64,
}

pub struct HeadManager {
    layout: StoreLayout,
    options: HeadManagerOptions,
    builder: Arc<dyn IndexBuilder>,
    /// Lock order: `active` before `pending`
    active: RwLock<Option<Arc<ActiveHead>>>,
    pending: RwLock<Option<Arc<TenantHeads>>>,
    /// Serializes start, rotate and tick
    rotation: Mutex<()>,
    metrics: HeadMetrics,
    shutdown: watch::Sender<bool>,
}

impl HeadManager {
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        options: HeadManagerOptions,
        builder: Arc<dyn IndexBuilder>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            layout: StoreLayout::new(name, dir),
            options,
            builder,
            active: RwLock::new(None),
            pending: RwLock::new(None),
            rotation: Mutex::new(()),
            metrics: HeadMetrics::default(),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        self.layout.name()
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn period(&self) -> Period {
        self.options.period
    }

    /// Catch up on unbuilt WALs, then open the head for the current period
    pub fn start(&self) -> HeadResult<()> {
        self.start_at(Utc::now())
    }

    pub fn start_at(&self, now: DateTime<Utc>) -> HeadResult<()> {
        let _rotation = self.rotation.lock();

        let scratch = self.layout.scratch_dir();
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch)?;
        }
        self.layout.ensure_dirs()?;

        // Legacy WALs hold the oldest data
        let legacy = legacy_wals(&self.layout)?;
        if !legacy.is_empty() {
            tracing::info!("Building {} legacy WAL directories", legacy.len());
            match self.builder.build_from_wals(now, &legacy, true) {
                Ok(()) => {
                    remove_wals(&legacy, None);
                    self.metrics.builds.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to build legacy WALs, leaving them for the next start: {}",
                        e
                    );
                }
            }
        }

        let period = self.options.period;
        for group in wal_groups(&self.layout.wal_dir(), period)? {
            if self.builder.is_built(&group) {
                tracing::info!("WAL group for period {} already built", group.period);
                remove_wals(&group.wals, None);
                continue;
            }

            tracing::info!(
                "Recovering {} WAL directories for period {}",
                group.wals.len(),
                group.period
            );
            self.builder
                .build_from_wals(period.time_for_period(group.period), &group.wals, false)?;
            self.metrics.builds.fetch_add(1, Ordering::Relaxed);
            remove_wals(&group.wals, None);
        }

        self.builder.start()?;
        self.rotate_locked(now)?;

        tracing::info!("Head manager {} started at {}", self.name(), now);
        Ok(())
    }

    /// Register chunks for a series in the active head.
    ///
    /// The WAL write happens first; if it fails nothing is applied.
    pub fn append(
        &self,
        tenant: &str,
        labels: &LabelSet,
        fp: Fingerprint,
        chunks: &[ChunkMeta],
    ) -> HeadResult<()> {
        // Held for the whole call so rotation waits for in-flight appends
        let guard = self.active.read();
        let active = guard.as_ref().ok_or(HeadError::NotStarted)?;
        if chunks.is_empty() {
            return Ok(());
        }

        let mut records = Vec::with_capacity(2);
        if !active.heads.has_series(tenant, fp) {
            records.push(WalRecord::series(tenant, fp, labels));
        }
        records.push(WalRecord::chunk_metas(tenant, fp, chunks));

        active.wal.log_all(&records)?;
        active.heads.append(tenant, labels, fp, chunks);

        self.metrics
            .records_logged
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Unconditionally rotate to a fresh head opened at `now`
    pub fn rotate(&self, now: DateTime<Utc>) -> HeadResult<()> {
        let _rotation = self.rotation.lock();
        self.rotate_locked(now)
    }

    /// Rotate if `now` is past the active head's period.
    ///
    /// Returns whether a rotation happened. Safe to call at any rate.
    pub fn tick(&self, now: DateTime<Utc>) -> HeadResult<bool> {
        let _rotation = self.rotation.lock();
        if self.is_stopped() {
            return Ok(false);
        }

        let start = match self.active.read().as_ref() {
            Some(active) => active.heads.start(),
            None => return Ok(false),
        };

        let period = self.options.period;
        if period.period_for(now) > period.period_for(start) {
            self.rotate_locked(now)?;
            Ok(true)
        } else {
            self.build_pending()?;
            Ok(false)
        }
    }

    fn rotate_locked(&self, now: DateTime<Utc>) -> HeadResult<()> {
        // An unbuilt head from the last rotation must go first
        self.build_pending()?;

        // `stop` may have run while the build was in flight
        if self.is_stopped() {
            return Err(HeadError::WalClosed);
        }

        let wal = HeadWal::open(self.layout.wal_path(now), now, self.options.wal)?;
        let next = Arc::new(ActiveHead {
            heads: Arc::new(TenantHeads::new(now, self.options.stripe_size)),
            wal,
        });

        let previous = {
            let mut active = self.active.write();
            let previous = active.replace(next);
            if let Some(previous) = &previous {
                *self.pending.write() = Some(Arc::clone(&previous.heads));
            }
            previous
        };

        let Some(previous) = previous else {
            tracing::info!("Opened head for {} at {}", self.name(), now);
            return Ok(());
        };

        if let Err(e) = previous.wal.stop() {
            tracing::warn!(
                "Failed to stop WAL {:?} of rotated head: {}",
                previous.wal.dir(),
                e
            );
        }
        self.metrics.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Rotated head for {}: {} -> {} ({})",
            self.name(),
            previous.heads.start(),
            now,
            previous.heads.stats()
        );

        self.build_pending()
    }

    /// Build the pending head, if any
    fn build_pending(&self) -> HeadResult<()> {
        let Some(heads) = self.pending.read().clone() else {
            return Ok(());
        };

        if let Err(e) = self.builder.build_from_head(&heads) {
            self.metrics.rotation_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Failed to build head started at {}, keeping it pending: {}",
                heads.start(),
                e
            );
            return Err(e);
        }
        self.metrics.builds.fetch_add(1, Ordering::Relaxed);

        {
            let mut pending = self.pending.write();
            if pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, &heads)) {
                *pending = None;
            }
        }

        // The period's WALs are now redundant
        let period = self.options.period;
        let active_dir = self
            .active
            .read()
            .as_ref()
            .map(|a| a.wal.dir().to_path_buf());
        for group in wal_groups(&self.layout.wal_dir(), period)? {
            if group.period == period.period_for(heads.start()) {
                remove_wals(&group.wals, active_dir.as_deref());
            }
        }

        tracing::info!("Built head started at {}", heads.start());
        Ok(())
    }

    /// Rotate on every period boundary until `stop` is called
    pub fn start_ticker(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(every);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }

                let m = Arc::clone(&manager);
                match tokio::task::spawn_blocking(move || m.tick(Utc::now())).await {
                    Ok(Ok(true)) => tracing::debug!("Ticker rotated head for {}", manager.name()),
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => tracing::error!("Head rotation failed: {}", e),
                    Err(e) => tracing::error!("Head rotation task failed: {}", e),
                }
            }

            tracing::debug!("Head ticker for {} stopped", manager.name());
        })
    }

    /// Stop the ticker and close the active WAL.
    ///
    /// Waits for an in-flight rotation; later rotations are refused.
    pub fn stop(&self) -> HeadResult<()> {
        self.shutdown.send_replace(true);
        let _rotation = self.rotation.lock();
        match self.active.read().as_ref() {
            Some(active) => active.wal.stop(),
            None => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn stats(&self) -> ManagerStats {
        let (active_start, head, wal_records) = match self.active.read().as_ref() {
            Some(active) => (
                Some(active.heads.start()),
                active.heads.stats(),
                active.wal.record_count(),
            ),
            None => (None, HeadStats::default(), 0),
        };

        ManagerStats {
            name: self.name().to_string(),
            period: self.options.period.duration(),
            active_start,
            head,
            wal_records,
            pending_build: self.pending.read().is_some(),
            rotations: self.metrics.rotations.load(Ordering::Relaxed),
            rotation_failures: self.metrics.rotation_failures.load(Ordering::Relaxed),
            builds: self.metrics.builds.load(Ordering::Relaxed),
            records_logged: self.metrics.records_logged.load(Ordering::Relaxed),
        }
    }
}

impl ChunkIndex for HeadManager {
    /// Pending head first, then the active head
    fn get_chunk_refs(
        &self,
        ctx: &QueryContext,
        query: &ChunkQuery<'_>,
        acc: &mut Vec<ChunkRef>,
    ) -> HeadResult<()> {
        let (pending, active) = {
            let active = self.active.read();
            let pending = self.pending.read();
            (
                pending.clone(),
                active.as_ref().map(|a| Arc::clone(&a.heads)),
            )
        };

        for heads in pending.iter().chain(active.iter()) {
            ctx.check()?;
            heads.get_chunk_refs(ctx, query, acc)?;
        }
        Ok(())
    }
}

fn remove_wals(wals: &[WalIdentifier], keep: Option<&Path>) {
    for wal in wals {
        if keep == Some(wal.path.as_path()) {
            continue;
        }
        match std::fs::remove_dir_all(&wal.path) {
            Ok(()) => tracing::debug!("Removed WAL {:?}", wal.path),
            Err(e) => tracing::warn!("Failed to remove WAL {:?}: {}", wal.path, e),
        }
    }
}

/// Snapshot of a head manager
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub name: String,
    pub period: Duration,
    pub active_start: Option<DateTime<Utc>>,
    pub head: HeadStats,
    pub wal_records: u64,
    pub pending_build: bool,
    pub rotations: u64,
    pub rotation_failures: u64,
    pub builds: u64,
    pub records_logged: u64,
}

impl fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self
            .active_start
            .map_or_else(|| "not started".to_string(), |t| t.to_rfc3339());
        write!(
            f,
            "Store: {}, Period: {}s, Active since: {}, Head: {}, WAL records: {}, Pending build: {}, Rotations: {} ({} failed), Builds: {}",
            self.name,
            self.period.as_secs(),
            start,
            self.head,
            self.wal_records,
            self.pending_build,
            self.rotations,
            self.rotation_failures,
            self.builds
        )
    }
}
