//! Counter registry
//!
//! Metric sink consumed by the arbiter. Counters are created on first use and
//! keyed by name (`"PortAllocator.Attempts"`, `"JobManager.NewJob.Success"`).

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

const MAX_SAMPLES: usize = 1024;

/// Point-in-time view of one counter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterValue {
    /// Raw number of increments plus recorded samples
    pub count: u64,
    /// Increments per second since the counter was created
    pub per_second: f64,
    /// Mean of recorded samples
    pub average: Option<f64>,
    /// 95th percentile of the most recent samples
    pub p95: Option<f64>,
}

/// Metric counter sink
pub trait CounterRegistry: Send + Sync {
    fn increment_by(&self, name: &str, by: u64);

    /// Records one sample of an average/percentile counter
    fn record_value(&self, name: &str, value: f64);

    fn snapshot(&self) -> BTreeMap<String, CounterValue>;

    fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCounterRegistry;

impl CounterRegistry for NoopCounterRegistry {
    fn increment_by(&self, _name: &str, _by: u64) {}

    fn record_value(&self, _name: &str, _value: f64) {}

    fn snapshot(&self) -> BTreeMap<String, CounterValue> {
        BTreeMap::new()
    }
}

#[derive(Debug)]
struct CounterState {
    count: u64,
    sum: f64,
    sampled: u64,
    recent: VecDeque<f64>,
    created_at: Instant,
}

impl CounterState {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sampled: 0,
            recent: VecDeque::new(),
            created_at: Instant::now(),
        }
    }

    fn value(&self) -> CounterValue {
        let elapsed = self.created_at.elapsed().as_secs_f64();
        let per_second = if elapsed > 0.0 {
            self.count as f64 / elapsed
        } else {
            0.0
        };

        let average = (self.sampled > 0).then(|| self.sum / self.sampled as f64);

        let p95 = if self.recent.is_empty() {
            None
        } else {
            let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
            Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
        };

        CounterValue {
            count: self.count,
            per_second,
            average,
            p95,
        }
    }
}

/// Keeps counters in process memory
#[derive(Debug, Default)]
pub struct InMemoryCounterRegistry {
    counters: Mutex<HashMap<String, CounterState>>,
}

impl InMemoryCounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current raw count of a counter, zero if never touched
    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

impl CounterRegistry for InMemoryCounterRegistry {
    fn increment_by(&self, name: &str, by: u64) {
        let mut counters = self.counters.lock().unwrap();
        let state = counters
            .entry(name.to_string())
            .or_insert_with(CounterState::new);
        state.count += by;
    }

    fn record_value(&self, name: &str, value: f64) {
        let mut counters = self.counters.lock().unwrap();
        let state = counters
            .entry(name.to_string())
            .or_insert_with(CounterState::new);

        state.count += 1;
        state.sampled += 1;
        state.sum += value;
        state.recent.push_back(value);
        if state.recent.len() > MAX_SAMPLES {
            state.recent.pop_front();
        }
    }

    fn snapshot(&self) -> BTreeMap<String, CounterValue> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, state)| (name.clone(), state.value()))
            .collect()
    }
}
