//! Call-site attribution for instrumented allocations.
//!
//! Services record the allocations they care about (model weights, batch
//! buffers, caches) under a call-site label. The tracer keeps the live set,
//! feeds `heap_allocated_mb` into snapshots and ranks call sites by size.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
struct AllocRecord {
    bytes: u64,
    callsite_hash: String,
}

#[derive(Debug, Clone, Default)]
struct SiteTotals {
    callsite: String,
    tag: Option<String>,
    live_bytes: u64,
    live_count: u64,
}

#[derive(Debug, Default)]
struct TracerState {
    next_alloc_id: u64,
    in_use_bytes: u64,
    peak_bytes: u64,
    live: BTreeMap<u64, AllocRecord>,
    sites: BTreeMap<String, SiteTotals>,
    free_missing: u64,
}

/// One row of [`AllocationTracer::top_sites`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSite {
    pub callsite: String,
    pub callsite_hash: String,
    pub tag: Option<String>,
    pub size_mb: f64,
    pub count: u64,
}

#[derive(Debug, Default)]
pub struct AllocationTracer {
    state: Mutex<TracerState>,
}

impl AllocationTracer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TracerState {
                next_alloc_id: 1,
                ..TracerState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TracerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records `bytes` allocated at `callsite` and returns an id for [`Self::free`].
    pub fn allocate(&self, bytes: u64, callsite: &str, tag: Option<&str>) -> u64 {
        let callsite_hash = blake3::hash(callsite.as_bytes()).to_hex().to_string();
        let mut st = self.lock();
        let alloc_id = st.next_alloc_id.max(1);
        st.next_alloc_id = alloc_id.saturating_add(1);
        st.in_use_bytes = st.in_use_bytes.saturating_add(bytes);
        st.peak_bytes = st.peak_bytes.max(st.in_use_bytes);

        let site = st
            .sites
            .entry(callsite_hash.clone())
            .or_insert_with(|| SiteTotals {
                callsite: callsite.to_string(),
                ..SiteTotals::default()
            });
        site.live_bytes = site.live_bytes.saturating_add(bytes);
        site.live_count = site.live_count.saturating_add(1);
        if let Some(tag) = tag {
            site.tag = Some(tag.to_string());
        }

        st.live.insert(
            alloc_id,
            AllocRecord {
                bytes,
                callsite_hash,
            },
        );
        alloc_id
    }

    /// Releases a recorded allocation. Returns `false` for unknown ids.
    pub fn free(&self, alloc_id: u64) -> bool {
        let mut st = self.lock();
        let Some(rec) = st.live.remove(&alloc_id) else {
            st.free_missing = st.free_missing.saturating_add(1);
            tracing::debug!(alloc_id, "free of unknown allocation");
            return false;
        };
        st.in_use_bytes = st.in_use_bytes.saturating_sub(rec.bytes);
        if let Some(site) = st.sites.get_mut(&rec.callsite_hash) {
            site.live_bytes = site.live_bytes.saturating_sub(rec.bytes);
            site.live_count = site.live_count.saturating_sub(1);
        }
        true
    }

    pub fn in_use_bytes(&self) -> u64 {
        self.lock().in_use_bytes
    }

    pub fn in_use_mb(&self) -> f64 {
        self.in_use_bytes() as f64 / BYTES_PER_MB
    }

    pub fn peak_bytes(&self) -> u64 {
        self.lock().peak_bytes
    }

    pub fn free_missing(&self) -> u64 {
        self.lock().free_missing
    }

    /// Up to `limit` call sites with live allocations, largest first.
    pub fn top_sites(&self, limit: usize) -> Vec<AllocationSite> {
        let st = self.lock();
        let mut sites: Vec<AllocationSite> = st
            .sites
            .iter()
            .filter(|(_, s)| s.live_count > 0)
            .map(|(hash, s)| AllocationSite {
                callsite: s.callsite.clone(),
                callsite_hash: hash.clone(),
                tag: s.tag.clone(),
                size_mb: s.live_bytes as f64 / BYTES_PER_MB,
                count: s.live_count,
            })
            .collect();
        sites.sort_by(|a, b| {
            b.size_mb
                .total_cmp(&a.size_mb)
                .then_with(|| a.callsite.cmp(&b.callsite))
        });
        sites.truncate(limit);
        sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn top_sites_sorts_descending_by_live_bytes() {
        let tracer = AllocationTracer::new();
        tracer.allocate(10 * MB, "tokenizer::load", None);
        tracer.allocate(50 * MB, "model::weights", Some("fp16"));
        tracer.allocate(20 * MB, "batch::buffers", None);
        tracer.allocate(5 * MB, "batch::buffers", None);

        let top = tracer.top_sites(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].callsite, "model::weights");
        assert_eq!(top[0].tag.as_deref(), Some("fp16"));
        assert_eq!(top[1].callsite, "batch::buffers");
        assert_eq!(top[1].count, 2);
        assert!((top[1].size_mb - 25.0).abs() < 1e-9);
    }

    #[test]
    fn free_releases_bytes_and_drops_empty_sites() {
        let tracer = AllocationTracer::new();
        let id = tracer.allocate(8 * MB, "cache::fill", None);
        assert!((tracer.in_use_mb() - 8.0).abs() < 1e-9);
        assert!(tracer.free(id));
        assert_eq!(tracer.in_use_bytes(), 0);
        assert_eq!(tracer.peak_bytes(), 8 * MB);
        assert!(tracer.top_sites(10).is_empty());
    }

    #[test]
    fn free_of_unknown_id_is_counted() {
        let tracer = AllocationTracer::new();
        assert!(!tracer.free(99));
        assert_eq!(tracer.free_missing(), 1);
    }
}
