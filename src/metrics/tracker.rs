use std::time::Instant;

use prometheus::Histogram;

/// Observes the elapsed time into a histogram when dropped.
///
/// Attached to a request when it is handed to a backend and released on
/// completion, so the histogram sees the remote round-trip regardless of
/// whether the request finished with a reply or an error.
pub struct Tracker {
    started: Instant,
    histogram: Histogram,
}

impl Tracker {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            started: Instant::now(),
            histogram,
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        let micros = self.started.elapsed().as_secs_f64() * 1_000_000.0;
        self.histogram.observe(micros);
    }
}
