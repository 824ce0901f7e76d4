//! Windowed latency sampler backing the per-channel end-to-end
//! processing latency stats. Holds the most recent samples in a ring;
//! percentile queries sort a snapshot.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PercentileValue {
    pub quantile: f64,
    pub value: i64,
}

pub struct LatencyStream {
    window: Vec<i64>,
    next: usize,
    count: u64,
    percentiles: Vec<f64>,
}

impl LatencyStream {
    pub fn new(window_size: usize, percentiles: Vec<f64>) -> Self {
        Self {
            window: Vec::with_capacity(window_size.max(1)),
            next: 0,
            count: 0,
            percentiles,
        }
    }

    pub fn insert(&mut self, latency_ns: i64) {
        self.count += 1;
        if self.window.len() < self.window.capacity() {
            self.window.push(latency_ns);
        } else {
            self.window[self.next] = latency_ns;
            self.next = (self.next + 1) % self.window.len();
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn result(&self) -> Vec<PercentileValue> {
        if self.window.is_empty() {
            return Vec::new();
        }
        let mut sorted = self.window.clone();
        sorted.sort_unstable();
        self.percentiles
            .iter()
            .map(|&q| {
                let rank = ((q * sorted.len() as f64).ceil() as usize)
                    .clamp(1, sorted.len());
                PercentileValue {
                    quantile: q,
                    value: sorted[rank - 1],
                }
            })
            .collect()
    }
}

impl Default for LatencyStream {
    fn default() -> Self {
        Self::new(1000, vec![0.99, 0.95])
    }
}
