//! Fixed-capacity sample window used by the resource watchdog.

/// Circular buffer of `u64` samples with whole-window statistics.
///
/// Samples are zero-initialised. [`SampleRing::mean`] averages over the
/// whole allocated capacity, so callers must gate on the boolean returned
/// by [`SampleRing::push`] before acting on any statistic.
#[derive(Debug, Default)]
pub struct SampleRing {
    buf: Vec<u64>,
    position: usize,
    filled: bool,
}

impl SampleRing {
    /// Create a ring holding `capacity` samples.
    ///
    /// Zero capacity disables the ring: pushes are accepted but it never
    /// reports full.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            position: 0,
            filled: false,
        }
    }

    /// Append a sample, overwriting the oldest once full.
    ///
    /// Returns true once at least `capacity` samples have been pushed.
    pub fn push(&mut self, sample: u64) -> bool {
        if self.buf.is_empty() {
            return false;
        }

        self.buf[self.position] = sample;
        self.position = (self.position + 1) % self.buf.len();
        // Latches on the first wrap-around.
        self.filled = self.filled || self.position == 0;
        self.filled
    }

    /// Arithmetic mean over the whole allocated window, zeroes included.
    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }

        let total: u64 = self.buf.iter().sum();
        total as f64 / self.buf.len() as f64
    }

    /// The most recently pushed sample. Meaningful only once full.
    pub fn newest_when_full(&self) -> u64 {
        if self.buf.is_empty() {
            return 0;
        }
        self.buf[(self.position + self.buf.len() - 1) % self.buf.len()]
    }

    /// The oldest retained sample. Meaningful only once full.
    pub fn oldest_when_full(&self) -> u64 {
        if self.buf.is_empty() {
            return 0;
        }
        self.buf[self.position]
    }

    /// Number of samples the window holds.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Drop all samples and reallocate with a new capacity.
    pub fn reset(&mut self, capacity: usize) {
        self.buf = vec![0; capacity];
        self.position = 0;
        self.filled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_reports_full_after_capacity_samples() {
        let mut ring = SampleRing::new(3);
        assert!(!ring.push(1));
        assert!(!ring.push(2));
        assert!(ring.push(3));
        // Stays full from then on.
        assert!(ring.push(4));
    }

    #[test]
    fn test_extrema_after_exactly_capacity_pushes() {
        let mut ring = SampleRing::new(4);
        for x in [10, 20, 30, 40] {
            ring.push(x);
        }
        assert_eq!(ring.oldest_when_full(), 10);
        assert_eq!(ring.newest_when_full(), 40);
    }

    #[test]
    fn test_extrema_track_overwrites() {
        let mut ring = SampleRing::new(3);
        for x in [1, 2, 3, 4, 5] {
            ring.push(x);
        }
        assert_eq!(ring.oldest_when_full(), 3);
        assert_eq!(ring.newest_when_full(), 5);
    }

    #[test]
    fn test_mean_spans_whole_capacity() {
        let mut ring = SampleRing::new(4);
        ring.push(100);
        ring.push(100);
        // Unwritten slots still contribute zero.
        assert_eq!(ring.mean(), 50.0);

        ring.push(100);
        ring.push(100);
        assert_eq!(ring.mean(), 100.0);
    }

    #[test]
    fn test_mean_is_fractional() {
        let mut ring = SampleRing::new(4);
        for x in [50, 80, 120, 200] {
            ring.push(x);
        }
        assert_eq!(ring.mean(), 112.5);
    }

    #[test]
    fn test_zero_capacity_ring_is_inert() {
        let mut ring = SampleRing::new(0);
        assert!(!ring.push(42));
        assert_eq!(ring.mean(), 0.0);
        assert_eq!(ring.capacity(), 0);
    }

    #[test]
    fn test_reset_clears_fill_state() {
        let mut ring = SampleRing::new(2);
        ring.push(1);
        ring.push(2);
        assert!(ring.push(3));

        ring.reset(3);
        assert_eq!(ring.capacity(), 3);
        assert!(!ring.push(1));
        assert!(!ring.push(2));
        assert!(ring.push(3));
    }
}
