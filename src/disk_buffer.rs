//! Disk invalidation buffering.
//!
//! Invalidations destined for the disk tier are not applied inline; they
//! accumulate in three sets and are drained by the cleanup worker in one
//! pass:
//!
//! - `explicit`: ids invalidated by callers or the pipeline,
//! - `scan`: ids discovered expired by a disk scan,
//! - `reclaim`: ids of evicted entries whose disk space can be reused.
//!
//! An id promoted to `explicit` leaves `scan`; the stronger intent wins
//! and the id is only processed once. The buffer counts as full by size
//! or by age since the last drain, and a full buffer is what prompts an
//! off-interval cleanup.
//!
//! Failure keeps the drained sets: `finish_cleanup(false)` restores them
//! so the next trigger retries the same work.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use crate::config::DiskBufferConfig;
use crate::entry::CacheId;
use crate::events::{InvalidationCause, InvalidationSource};
use crate::time::Timestamp;

/// An explicitly invalidated id with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExplicitInvalidation {
    pub cause: InvalidationCause,
    pub source: InvalidationSource,
}

/// The work checked out by one cleanup pass.
#[derive(Debug)]
pub struct CleanupPass {
    /// Ids to delete from disk, with provenance for event reporting.
    pub explicit: HashMap<CacheId, ExplicitInvalidation>,
    /// Scan-discovered expired ids to delete without events.
    pub scan: HashSet<CacheId>,
    /// Ids whose disk space may be reused.
    pub reclaim: HashSet<CacheId>,
    /// Whether the disk tier should also scan for newly expired entries.
    pub scan_expired: bool,
}

impl CleanupPass {
    /// Whether the pass carries no work at all.
    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && self.scan.is_empty() && self.reclaim.is_empty() && !self.scan_expired
    }
}

#[derive(Debug)]
struct Inner {
    explicit: HashMap<CacheId, ExplicitInvalidation>,
    scan: HashSet<CacheId>,
    reclaim: HashSet<CacheId>,
    last_drain: Timestamp,
    scan_requested: bool,
    cleanup_active: bool,
}

/// Buffered invalidation state for one instance's disk tier.
#[derive(Debug)]
pub struct DiskInvalidationBuffer {
    inner: Mutex<Inner>,
    config: DiskBufferConfig,
}

impl DiskInvalidationBuffer {
    /// Create an empty buffer; the age window starts now.
    pub fn new(config: DiskBufferConfig) -> Self {
        Self::with_epoch(config, Timestamp::now())
    }

    /// Create with an explicit age-window start, for fabricated clocks.
    pub fn with_epoch(config: DiskBufferConfig, now: Timestamp) -> Self {
        Self {
            inner: Mutex::new(Inner {
                explicit: HashMap::new(),
                scan: HashSet::new(),
                reclaim: HashSet::new(),
                last_drain: now,
                scan_requested: false,
                cleanup_active: false,
            }),
            config,
        }
    }

    /// Buffer an explicit invalidation. Promotes the id out of the scan
    /// set if a scan found it first.
    pub fn add_explicit(&self, id: CacheId, cause: InvalidationCause, source: InvalidationSource) {
        let mut inner = self.inner.lock().expect("disk buffer poisoned");
        inner.scan.remove(&id);
        inner
            .explicit
            .insert(id, ExplicitInvalidation { cause, source });
    }

    /// Buffer a scan-discovered expired id. Ignored when an explicit
    /// invalidation for the id is already pending.
    pub fn add_scan(&self, id: CacheId) {
        let mut inner = self.inner.lock().expect("disk buffer poisoned");
        if !inner.explicit.contains_key(&id) {
            inner.scan.insert(id);
        }
    }

    /// Buffer an id whose disk space may be reused.
    pub fn add_reclaim(&self, id: CacheId) {
        let mut inner = self.inner.lock().expect("disk buffer poisoned");
        inner.reclaim.insert(id);
    }

    /// Total buffered ids across all three sets.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("disk buffer poisoned");
        inner.explicit.len() + inner.scan.len() + inner.reclaim.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer has filled by size or by age.
    ///
    /// A `true` answer resets the age window, so one overdue buffer
    /// prompts one off-interval cleanup rather than one per check.
    pub fn is_full(&self, now: Timestamp) -> bool {
        let mut inner = self.inner.lock().expect("disk buffer poisoned");
        let size = inner.explicit.len() + inner.scan.len() + inner.reclaim.len();
        let by_size = size >= self.config.max_buffered_ids;
        let by_age = size > 0 && now.since(inner.last_drain) >= self.config.max_buffer_age;
        if by_size || by_age {
            inner.last_drain = now;
            return true;
        }
        false
    }

    /// Ask the next cleanup pass to also scan the disk tier for expired
    /// entries.
    pub fn invoke_background_invalidation(&self, scan: bool) {
        let mut inner = self.inner.lock().expect("disk buffer poisoned");
        inner.scan_requested |= scan;
    }

    /// Check out the buffered work for one cleanup pass.
    ///
    /// Returns `None` while another pass is active or when there is
    /// nothing to do. The buffer keeps accepting new ids while the pass
    /// runs; they belong to the next one.
    pub fn begin_cleanup(&self, now: Timestamp) -> Option<CleanupPass> {
        let mut inner = self.inner.lock().expect("disk buffer poisoned");
        if inner.cleanup_active {
            return None;
        }
        let pass = CleanupPass {
            explicit: std::mem::take(&mut inner.explicit),
            scan: std::mem::take(&mut inner.scan),
            reclaim: std::mem::take(&mut inner.reclaim),
            scan_expired: std::mem::take(&mut inner.scan_requested),
        };
        if pass.is_empty() {
            return None;
        }
        inner.cleanup_active = true;
        inner.last_drain = now;
        debug!(
            explicit = pass.explicit.len(),
            scan = pass.scan.len(),
            reclaim = pass.reclaim.len(),
            scan_expired = pass.scan_expired,
            "disk cleanup pass checked out"
        );
        Some(pass)
    }

    /// Conclude a pass. On failure the pass's work is restored for the
    /// next trigger; ids buffered meanwhile take precedence on conflict.
    pub fn finish_cleanup(&self, pass: CleanupPass, success: bool) {
        let mut inner = self.inner.lock().expect("disk buffer poisoned");
        inner.cleanup_active = false;
        if success {
            return;
        }
        for (id, record) in pass.explicit {
            inner.explicit.entry(id).or_insert(record);
        }
        for id in pass.scan {
            if !inner.explicit.contains_key(&id) {
                inner.scan.insert(id);
            }
        }
        inner.reclaim.extend(pass.reclaim);
        inner.scan_requested |= pass.scan_expired;
    }
}
