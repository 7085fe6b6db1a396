//! Port allocator
//!
//! Picks TCP ports for new Grid Server instances. A port is handed out only
//! when no listener is bound to it and it was not handed out within the reuse
//! cooldown. Selection and reservation happen under one lock, so concurrent
//! callers never receive the same port.

use grid_core::metrics::CounterRegistry;
use grid_core::random::Random;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::net;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("No available port found after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
}

/// Reports whether a port already has an OS-level listener
pub trait PortProbe: Send + Sync {
    fn is_port_in_use(&self, port: u16) -> bool;
}

/// Probe backed by the `/proc/net/tcp` listener table
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcTcpTableProbe;

impl PortProbe for ProcTcpTableProbe {
    fn is_port_in_use(&self, port: u16) -> bool {
        net::listening_ports().contains_key(&port)
    }
}

/// Allocator settings
#[derive(Debug, Clone)]
pub struct PortAllocatorSettings {
    /// Inclusive start, exclusive end
    pub range: Range<u16>,
    pub max_attempts: u32,
    pub reuse_forbidden: Duration,
}

impl Default for PortAllocatorSettings {
    fn default() -> Self {
        Self {
            range: 45000..47000,
            max_attempts: 1000,
            reuse_forbidden: Duration::from_secs(30),
        }
    }
}

/// Hands out unused ports within a fixed range
pub struct PortAllocator {
    settings: PortAllocatorSettings,
    probe: Arc<dyn PortProbe>,
    random: Arc<dyn Random>,
    counters: Arc<dyn CounterRegistry>,
    /// Recently allocated ports and when they were handed out
    recent: Mutex<HashMap<u16, Instant>>,
}

impl PortAllocator {
    /// Creates a new port allocator
    ///
    /// # Arguments
    /// * `settings` - Range, attempt bound and reuse cooldown
    /// * `probe` - Source of OS-level listener information
    /// * `random` - Random source for port selection
    /// * `counters` - Registry receiving allocation counters
    pub fn new(
        settings: PortAllocatorSettings,
        probe: Arc<dyn PortProbe>,
        random: Arc<dyn Random>,
        counters: Arc<dyn CounterRegistry>,
    ) -> Self {
        Self {
            settings,
            probe,
            random,
            counters,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PortAllocatorSettings {
        &self.settings
    }

    /// Finds a free port and reserves it for the reuse cooldown
    ///
    /// Not retried internally: a timeout goes back to the caller, which
    /// decides whether instance creation is attempted again.
    pub fn find_next_available_port(&self) -> Result<u16, PortError> {
        let started = Instant::now();
        self.counters.increment("PortAllocator.Attempts");

        let mut recent = self.recent.lock().unwrap();
        let now = Instant::now();
        recent.retain(|_, at| now.duration_since(*at) < self.settings.reuse_forbidden);

        let start = i64::from(self.settings.range.start);
        let end = i64::from(self.settings.range.end);

        for attempt in 1..=self.settings.max_attempts {
            let port = self.random.next_i64_in(start, end) as u16;

            if recent.contains_key(&port) {
                continue;
            }

            if self.probe.is_port_in_use(port) {
                continue;
            }

            recent.insert(port, Instant::now());

            let elapsed = started.elapsed();
            self.counters.increment("PortAllocator.Successes");
            self.counters
                .record_value("PortAllocator.AllocationTimeMs", elapsed.as_secs_f64() * 1000.0);

            debug!(
                "FindNextAvailablePort. Allocated port {} after {} attempt(s) in {:?}",
                port, attempt, elapsed
            );
            return Ok(port);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.counters.increment("PortAllocator.Failures");
        warn!(
            "FindNextAvailablePort. No port found after {} attempts in {} ms",
            self.settings.max_attempts, elapsed_ms
        );

        Err(PortError::Timeout { elapsed_ms })
    }

    /// Lifts the reuse cooldown for a port
    pub fn remove_port_from_cache_if_exists(&self, port: u16) {
        if self.recent.lock().unwrap().remove(&port).is_some() {
            debug!("RemovePortFromCacheIfExists. Removed port {} from cache", port);
        }
    }

    /// Ports currently under the reuse cooldown
    pub fn cached_ports(&self) -> Vec<u16> {
        let now = Instant::now();
        let mut ports: Vec<u16> = self
            .recent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, at)| now.duration_since(**at) < self.settings.reuse_forbidden)
            .map(|(port, _)| *port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_core::metrics::InMemoryCounterRegistry;
    use grid_core::random::{SeededRandom, ThreadLocalRandom};
    use std::collections::HashSet;

    struct FixedProbe(HashSet<u16>);

    impl PortProbe for FixedProbe {
        fn is_port_in_use(&self, port: u16) -> bool {
            self.0.contains(&port)
        }
    }

    fn allocator(range: Range<u16>, in_use: &[u16], reuse_forbidden: Duration) -> PortAllocator {
        PortAllocator::new(
            PortAllocatorSettings {
                range,
                max_attempts: 1000,
                reuse_forbidden,
            },
            Arc::new(FixedProbe(in_use.iter().copied().collect())),
            Arc::new(SeededRandom::new(7)),
            Arc::new(InMemoryCounterRegistry::new()),
        )
    }

    #[test]
    fn test_skips_ports_in_use() {
        let ports = allocator(45000..45004, &[45000, 45001, 45002], Duration::from_secs(30));

        assert_eq!(ports.find_next_available_port().unwrap(), 45003);
    }

    #[test]
    fn test_reuse_cooldown() {
        let ports = allocator(45000..45002, &[], Duration::from_secs(30));

        let first = ports.find_next_available_port().unwrap();
        let second = ports.find_next_available_port().unwrap();
        assert_ne!(first, second);

        // Both ports are free at the OS level but still cooling down
        let err = ports.find_next_available_port().unwrap_err();
        assert!(matches!(err, PortError::Timeout { .. }));

        ports.remove_port_from_cache_if_exists(first);
        assert_eq!(ports.find_next_available_port().unwrap(), first);
    }

    #[test]
    fn test_cooldown_expires() {
        let ports = allocator(45000..45001, &[], Duration::from_millis(20));

        assert_eq!(ports.find_next_available_port().unwrap(), 45000);
        assert!(ports.find_next_available_port().is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(ports.find_next_available_port().unwrap(), 45000);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let in_use: Vec<u16> = (45000..45100).step_by(3).collect();
        let ports = Arc::new(PortAllocator::new(
            PortAllocatorSettings {
                range: 45000..45100,
                max_attempts: 100_000,
                reuse_forbidden: Duration::from_secs(30),
            },
            Arc::new(FixedProbe(in_use.iter().copied().collect())),
            Arc::new(ThreadLocalRandom),
            Arc::new(InMemoryCounterRegistry::new()),
        ));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || ports.find_next_available_port().unwrap())
            })
            .collect();

        let allocated: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let unique: HashSet<u16> = allocated.iter().copied().collect();

        assert_eq!(unique.len(), allocated.len());
        assert!(allocated.iter().all(|p| !in_use.contains(p)));
    }

    #[test]
    fn test_counters_recorded() {
        let counters = Arc::new(InMemoryCounterRegistry::new());
        let ports = PortAllocator::new(
            PortAllocatorSettings {
                range: 45000..45001,
                max_attempts: 10,
                reuse_forbidden: Duration::from_secs(30),
            },
            Arc::new(FixedProbe(HashSet::new())),
            Arc::new(SeededRandom::new(1)),
            counters.clone(),
        );

        ports.find_next_available_port().unwrap();
        let _ = ports.find_next_available_port();

        assert_eq!(counters.count("PortAllocator.Attempts"), 2);
        assert_eq!(counters.count("PortAllocator.Successes"), 1);
        assert_eq!(counters.count("PortAllocator.Failures"), 1);
    }
}
