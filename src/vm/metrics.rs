use serde::Serialize;
use std::{
    fmt::{self, Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Member resolutions answered from the resolver cache
    pub member_cache_hits: AtomicU64,
    /// Member resolutions that had to search the class directory
    pub member_cache_misses: AtomicU64,
    /// Template lookups that found an already synthesized template
    pub template_cache_hits: AtomicU64,
    /// Template lookups that synthesized a template
    pub template_cache_misses: AtomicU64,
    /// Number of times a thread blocked on another thread's class initialization
    pub init_wait_count: AtomicU64,
    /// Weak compare-and-set calls that failed although the expected value matched
    pub weak_cas_spurious_failures: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_member_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.member_cache_hits
        } else {
            &self.member_cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_template_lookup(&self, hit: bool) {
        let counter = if hit {
            &self.template_cache_hits
        } else {
            &self.template_cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_init_wait(&self) {
        self.init_wait_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spurious_failure(&self) {
        self.weak_cas_spurious_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cached_templates: usize, objects: usize) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            members: CacheStat {
                hits: load(&self.member_cache_hits),
                misses: load(&self.member_cache_misses),
            },
            templates: CacheStat {
                hits: load(&self.template_cache_hits),
                misses: load(&self.template_cache_misses),
            },
            cached_templates,
            init_waits: load(&self.init_wait_count),
            weak_cas_spurious_failures: load(&self.weak_cas_spurious_failures),
            objects,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStat {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStat {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

impl Display for CacheStat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hits, {} misses ({:.1}% hit rate)",
            self.hits,
            self.misses,
            self.hit_rate()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub members: CacheStat,
    pub templates: CacheStat,
    pub cached_templates: usize,
    pub init_waits: u64,
    pub weak_cas_spurious_failures: u64,
    pub objects: usize,
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Runtime Cache Statistics:")?;
        writeln!(f, "  Member Resolution: {}", self.members)?;
        writeln!(f, "  Calling Templates: {}", self.templates)?;
        writeln!(f, "  Templates Cached:  {}", self.cached_templates)?;
        writeln!(f, "  Init Waits:        {}", self.init_waits)?;
        writeln!(f, "  Spurious Weak CAS: {}", self.weak_cas_spurious_failures)?;
        write!(f, "  Live Objects:      {}", self.objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = RuntimeMetrics::new();
        metrics.record_member_lookup(false);
        metrics.record_member_lookup(true);
        metrics.record_member_lookup(true);
        metrics.record_template_lookup(false);
        let stats = metrics.snapshot(1, 3);
        assert_eq!(stats.members, CacheStat { hits: 2, misses: 1 });
        assert_eq!(stats.templates.misses, 1);
        assert!(stats.to_string().contains("2 hits, 1 misses (66.7% hit rate)"));
    }
}
