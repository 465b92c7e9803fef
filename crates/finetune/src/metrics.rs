use std::collections::{BTreeMap, VecDeque};

/// Number of samples the rates are computed over.
pub const THROUGHPUT_WINDOW: usize = 50;

const COUNTERS: [&str; 4] = ["time", "batches", "samples", "lengths"];
const RATES: [&str; 3] = ["batches_per_sec", "samples_per_sec", "items_per_sec"];

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    time: f64,
    batches: u64,
    samples: u64,
    lengths: u64,
}

/// Sliding-window throughput over cumulative counters.
///
/// Counters passed to [`update`](Self::update) are running totals for this
/// worker. Rates appear once the window holds [`THROUGHPUT_WINDOW`] samples;
/// global rates are the per-device rates scaled by the world size.
#[derive(Debug, Clone)]
pub struct ThroughputMonitor {
    window: usize,
    world_size: usize,
    history: VecDeque<Sample>,
}

impl ThroughputMonitor {
    pub fn new(world_size: usize) -> Self {
        Self::with_window(world_size, THROUGHPUT_WINDOW)
    }

    pub fn with_window(world_size: usize, window: usize) -> Self {
        Self {
            window: window.max(2),
            world_size: world_size.max(1),
            history: VecDeque::with_capacity(window.max(2)),
        }
    }

    /// Every key [`compute`](Self::compute) can return.
    pub fn metric_names() -> Vec<String> {
        let mut names: Vec<String> = COUNTERS.iter().map(|name| name.to_string()).collect();
        names.extend(RATES.iter().map(|name| name.to_string()));
        names.extend(RATES.iter().map(|name| format!("device/{name}")));
        names
    }

    /// Records totals at `time` seconds since the start of training.
    pub fn update(&mut self, time: f64, batches: u64, samples: u64, lengths: u64) {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(Sample {
            time,
            batches,
            samples,
            lengths,
        });
    }

    pub fn compute(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        let Some(last) = self.history.back() else {
            return out;
        };
        let counters = [
            last.time,
            last.batches as f64,
            last.samples as f64,
            last.lengths as f64,
        ];
        for (name, value) in COUNTERS.iter().zip(counters) {
            out.insert(name.to_string(), value);
        }

        if self.history.len() < self.window {
            return out;
        }
        let Some(first) = self.history.front() else {
            return out;
        };
        let elapsed = last.time - first.time;
        if elapsed <= 0.0 {
            return out;
        }
        let world = self.world_size as f64;
        let deltas = [
            last.batches - first.batches,
            last.samples - first.samples,
            last.lengths - first.lengths,
        ];
        for (name, delta) in RATES.iter().zip(deltas) {
            let per_device = delta as f64 / elapsed;
            out.insert(format!("device/{name}"), per_device);
            out.insert(name.to_string(), per_device * world);
        }
        out
    }
}
