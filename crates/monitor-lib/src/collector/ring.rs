//! Fixed-capacity ring of metrics samples
//!
//! One ring per container, oldest sample evicted when full. The default
//! capacity of 240 holds about an hour at the 15s collection interval.

use std::collections::VecDeque;

use crate::models::MetricsSample;

/// Default per-container sample capacity
pub const DEFAULT_CAPACITY: usize = 240;

/// Overwrite-oldest time series for one container
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: VecDeque<MetricsSample>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when at capacity
    pub fn push(&mut self, sample: MetricsSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Most recently pushed sample
    pub fn latest(&self) -> Option<&MetricsSample> {
        self.samples.back()
    }

    /// Full contents, oldest first
    pub fn to_vec(&self) -> Vec<MetricsSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(seq: i64) -> MetricsSample {
        MetricsSample {
            container_id: "c1".to_string(),
            name: "plat-shop-acme-web".to_string(),
            app_id: "shop".to_string(),
            tenant_id: "acme".to_string(),
            service: "web".to_string(),
            cpu_percent: seq as f64,
            mem_usage_bytes: 0,
            mem_limit_bytes: 0,
            mem_percent: 0.0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            timestamp: chrono::DateTime::from_timestamp(1_700_000_000 + seq, 0).unwrap(),
        }
    }

    #[test]
    fn test_push_within_capacity_keeps_everything() {
        let mut ring = SampleRing::new(10);
        for seq in 0..5 {
            ring.push(sample_at(seq));
        }
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.latest().unwrap().cpu_percent, 4.0);
    }

    #[test]
    fn test_overflow_retains_most_recent_in_order() {
        let mut ring = SampleRing::new(5);
        for seq in 0..12 {
            ring.push(sample_at(seq));
        }

        assert_eq!(ring.len(), 5);
        let contents = ring.to_vec();
        let cpus: Vec<f64> = contents.iter().map(|s| s.cpu_percent).collect();
        assert_eq!(cpus, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
        // chronological, oldest first
        assert!(contents.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_latest_always_tracks_last_push() {
        let mut ring = SampleRing::new(3);
        assert!(ring.latest().is_none());
        for seq in 0..7 {
            ring.push(sample_at(seq));
            assert_eq!(ring.latest().unwrap().cpu_percent, seq as f64);
        }
    }

    #[test]
    fn test_to_vec_never_exceeds_capacity() {
        let mut ring = SampleRing::new(4);
        for seq in 0..100 {
            ring.push(sample_at(seq));
            assert!(ring.to_vec().len() <= 4);
        }
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut ring = SampleRing::new(0);
        ring.push(sample_at(1));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.capacity(), 1);
    }
}
