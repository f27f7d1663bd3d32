/// Per-run latency samples in microseconds.
///
/// Unlike the engine's running aggregates this keeps every sample so that
/// percentiles can be answered. Every query on an empty set returns
/// `f64::NAN`.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    samples: Vec<f64>,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        Self { samples: Vec::new(), sum: 0.0, min: f64::INFINITY, max: f64::NEG_INFINITY }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { samples: Vec::with_capacity(n), ..Self::new() }
    }

    pub fn add_sample(&mut self, latency_us: f64) {
        self.sum += latency_us;
        self.min = self.min.min(latency_us);
        self.max = self.max.max(latency_us);
        self.samples.push(latency_us);
    }

    pub fn get_sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn get_average(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.sum / self.samples.len() as f64
    }

    pub fn get_min(&self) -> f64 {
        if self.samples.is_empty() { f64::NAN } else { self.min }
    }

    pub fn get_max(&self) -> f64 {
        if self.samples.is_empty() { f64::NAN } else { self.max }
    }

    /// Nearest-rank percentile: index `ceil(p * n / 100) - 1`, clamped to `[0, n-1]`.
    pub fn get_percentile(&self, p: f64) -> f64 {
        let n = self.samples.len();
        if n == 0 || p.is_nan() {
            return f64::NAN;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = (p * n as f64 / 100.0).ceil() as i64 - 1;
        sorted[rank.clamp(0, n as i64 - 1) as usize]
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(v: &[f64]) -> LatencyStats {
        let mut s = LatencyStats::new();
        v.iter().for_each(|&x| s.add_sample(x));
        s
    }

    #[test]
    fn nearest_rank() {
        let s = stats(&[40.0, 10.0, 30.0, 20.0]);
        assert_eq!(s.get_percentile(50.0), 20.0);
        assert_eq!(s.get_percentile(75.0), 30.0);
        assert_eq!(s.get_percentile(100.0), 40.0);
        assert_eq!(s.get_percentile(0.0), 10.0);
        assert_eq!(s.get_percentile(250.0), 40.0);
        assert_eq!(s.get_percentile(-5.0), 10.0);
    }

    #[test]
    fn whole_percent_ranks_are_exact() {
        let s = stats(&(1..=100).map(f64::from).collect::<Vec<_>>());
        for p in [1, 7, 14, 28, 29, 56, 57, 99] {
            assert_eq!(s.get_percentile(f64::from(p)), f64::from(p), "p{}", p);
        }
    }

    #[test]
    fn aggregates() {
        let s = stats(&[10.0, 20.0, 30.0, 40.0]);
        assert_eq!(s.get_average(), 25.0);
        assert_eq!(s.get_min(), 10.0);
        assert_eq!(s.get_max(), 40.0);
        assert_eq!(s.get_sample_count(), 4);
    }

    #[test]
    fn empty_is_nan_and_reset_clears() {
        let mut s = stats(&[1.0, 2.0]);
        s.reset();
        assert_eq!(s.get_sample_count(), 0);
        assert!(s.get_percentile(50.0).is_nan());
        assert!(s.get_average().is_nan());
        assert!(s.get_min().is_nan());
        assert!(s.get_max().is_nan());
        s.add_sample(5.0);
        assert_eq!(s.get_min(), 5.0);
        assert_eq!(s.get_max(), 5.0);
    }
}
