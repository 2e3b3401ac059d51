//! Rolling window of operation latencies

use std::time::Duration;

/// Keeps the most recent `capacity` samples, overwriting the oldest.
pub struct LatencyWindow {
    samples: Vec<Duration>,
    capacity: usize,
    index: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            index: 0,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.index] = sample;
        }
        self.index = (self.index + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().sum();
        sum / self.samples.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().copied().max().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_window_wraps() {
        let mut window = LatencyWindow::new(3);
        assert_eq!(window.average(), Duration::ZERO);

        window.record(Duration::from_micros(10));
        window.record(Duration::from_micros(20));
        window.record(Duration::from_micros(30));
        assert_eq!(window.average(), Duration::from_micros(20));
        assert_eq!(window.max(), Duration::from_micros(30));

        // Oldest sample (10us) is overwritten
        window.record(Duration::from_micros(40));
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Duration::from_micros(30)); // (20 + 30 + 40) / 3
        assert_eq!(window.max(), Duration::from_micros(40));
    }
}
