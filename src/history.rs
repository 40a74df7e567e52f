//! Bounded time series used for charting and statistics.

use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 300;

/// Fixed-capacity FIFO of samples in append order. Once full, every append
/// evicts exactly one oldest sample.
#[derive(Debug, Clone)]
pub struct HistoryBuffer<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stats {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

impl<T: Clone> HistoryBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn append(&mut self, value: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.samples.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Builds a buffer with a new capacity, keeping the newest samples that fit.
    pub fn resized(&self, capacity: usize) -> Self {
        let mut out = Self::new(capacity);
        let skip = self.samples.len().saturating_sub(out.capacity);
        for v in self.samples.iter().skip(skip) {
            out.append(v.clone());
        }
        out
    }
}

impl HistoryBuffer<f64> {
    /// Statistics over the current contents. An empty buffer yields all zeros.
    pub fn stats(&self) -> Stats {
        let Some(&current) = self.samples.back() else {
            return Stats::default();
        };

        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0_f64;
        for &v in &self.samples {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
            sum += v;
        }

        Stats {
            current,
            min,
            max,
            average: sum / self.samples.len() as f64,
        }
    }

    /// Centred moving average, window clipped at both ends.
    pub fn smoothed(&self, window: usize) -> Vec<f64> {
        let data: Vec<f64> = self.snapshot();
        let half = window.max(1) / 2;
        (0..data.len())
            .map(|i| {
                let start = i.saturating_sub(half);
                let end = (i + half + 1).min(data.len());
                let slice = &data[start..end];
                slice.iter().sum::<f64>() / slice.len() as f64
            })
            .collect()
    }
}

/// X-axis labels (`M:SS` of elapsed time) for `count` points spaced
/// `interval_secs` apart; the newest point is `0:00`.
pub fn time_labels(count: usize, interval_secs: u64) -> Vec<String> {
    let total = (count.saturating_sub(1) as u64) * interval_secs;
    (0..count as u64)
        .map(|i| {
            let elapsed = total - i * interval_secs;
            format!("{}:{:02}", elapsed / 60, elapsed % 60)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_n_values_in_order() {
        for cap in 1..=8 {
            let mut buf = HistoryBuffer::new(cap);
            let m = cap * 3 + 1;
            for i in 0..m {
                buf.append(i as f64);
            }
            let expected: Vec<f64> = ((m - cap)..m).map(|i| i as f64).collect();
            assert_eq!(buf.len(), cap);
            assert_eq!(buf.snapshot(), expected, "capacity {cap}");
        }
    }

    #[test]
    fn empty_stats_are_zero() {
        let buf: HistoryBuffer<f64> = HistoryBuffer::new(10);
        assert_eq!(buf.stats(), Stats::default());
    }

    #[test]
    fn stats_over_three_values() {
        let mut buf = HistoryBuffer::new(5);
        for v in [10.0, 20.0, 30.0] {
            buf.append(v);
        }
        let stats = buf.stats();
        assert_eq!(stats.current, 30.0);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.average, 20.0);
    }

    #[test]
    fn single_value_stats() {
        let mut buf = HistoryBuffer::new(3);
        buf.append(42.5);
        let stats = buf.stats();
        assert_eq!(stats.current, 42.5);
        assert_eq!(stats.min, 42.5);
        assert_eq!(stats.max, 42.5);
        assert_eq!(stats.average, 42.5);
    }

    #[test]
    fn stats_follow_eviction() {
        let mut buf = HistoryBuffer::new(2);
        for v in [100.0, 1.0, 2.0] {
            buf.append(v);
        }
        let stats = buf.stats();
        assert_eq!(stats.max, 2.0);
        assert_eq!(stats.min, 1.0);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let mut buf = HistoryBuffer::new(0);
        buf.append(1);
        buf.append(2);
        assert_eq!(buf.capacity(), 1);
        assert_eq!(buf.snapshot(), vec![2]);
    }

    #[test]
    fn resize_keeps_tail() {
        let mut buf = HistoryBuffer::new(5);
        for v in 1..=5 {
            buf.append(v);
        }
        let smaller = buf.resized(3);
        assert_eq!(smaller.snapshot(), vec![3, 4, 5]);
        let larger = buf.resized(10);
        assert_eq!(larger.snapshot(), vec![1, 2, 3, 4, 5]);
        assert_eq!(larger.capacity(), 10);
    }

    #[test]
    fn clear_empties_buffer() {
        let mut buf = HistoryBuffer::new(4);
        buf.append(1.0);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.stats(), Stats::default());
    }

    #[test]
    fn smoothing_averages_neighbours() {
        let mut buf = HistoryBuffer::new(5);
        for v in [0.0, 3.0, 6.0] {
            buf.append(v);
        }
        assert_eq!(buf.smoothed(3), vec![1.5, 3.0, 4.5]);
    }

    #[test]
    fn labels_count_down_to_zero() {
        assert_eq!(time_labels(3, 30), vec!["1:00", "0:30", "0:00"]);
        assert!(time_labels(0, 1).is_empty());
    }
}
