use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Tracks acquisition statistics, with both
/// *all-time* totals and a *sliding 1 s window* rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time number of samples
    pub total_samples: u64,
    /// All-time number of updates (polls or segments)
    pub n_updates: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    updates: VecDeque<(Instant, u64)>,
    samples_in_window: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_samples: 0,
            n_updates: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            updates: VecDeque::new(),
            samples_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average since `t_begin`, in samples/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_samples as f64 / secs
    }

    /// Rate over the sliding window, in samples/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.samples_in_window as f64 / secs
    }

    pub fn increment(&mut self, samples: u64) {
        self.increment_at(Instant::now(), samples);
    }

    /// Records `samples` arriving at `now`, evicting window entries older
    /// than the window length.
    pub fn increment_at(&mut self, now: Instant, samples: u64) {
        self.total_samples += samples;
        self.n_updates += 1;

        self.updates.push_back((now, samples));
        self.samples_in_window += samples;

        while let Some(&(ts, n)) = self.updates.front() {
            if now.duration_since(ts) > self.window {
                self.updates.pop_front();
                self.samples_in_window -= n;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_samples = 0;
        self.n_updates = 0;
        self.t_begin = Instant::now();
        self.updates.clear();
        self.samples_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_forgets_old_updates() {
        let mut counter = Counter::new();
        let t0 = Instant::now();
        counter.increment_at(t0, 100);
        counter.increment_at(t0 + Duration::from_millis(500), 20);
        assert_eq!(counter.rate(), 120.0);

        counter.increment_at(t0 + Duration::from_millis(2000), 50);
        assert_eq!(counter.rate(), 50.0);
        assert_eq!(counter.total_samples, 170);
        assert_eq!(counter.n_updates, 3);
    }

    #[test]
    fn reset_clears_everything() {
        let mut counter = Counter::new();
        counter.increment(10);
        counter.reset();
        assert_eq!(counter.total_samples, 0);
        assert_eq!(counter.rate(), 0.0);
    }
}
