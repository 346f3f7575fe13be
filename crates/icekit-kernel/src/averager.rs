//! [`Averager`] – drained-on-read mean accumulator, and [`AverageTable`], the
//! per-session collection of averagers keyed by metric id.
//!
//! Every [`Averager::get`] starts a fresh window: the buffer is cleared
//! whether or not the caller uses the result.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Accumulates samples for one metric until drained.
#[derive(Debug, Default)]
pub struct Averager {
    samples: Mutex<Vec<f64>>,
}

impl Averager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, value: f64) {
        self.samples.lock().push(value);
    }

    /// Mean of the current window, or `0.0` when nothing was added. Clears
    /// the window.
    pub fn get(&self) -> f64 {
        self.take_mean().unwrap_or(0.0)
    }

    /// Like [`get`][Self::get] but distinguishes an empty window.
    pub fn take_mean(&self) -> Option<f64> {
        let mut samples = self.samples.lock();
        let mean = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<f64>() / samples.len() as f64)
        };
        samples.clear();
        mean
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lazily populated map from metric id to [`Averager`].
#[derive(Debug, Default)]
pub struct AverageTable {
    averagers: Mutex<HashMap<String, Arc<Averager>>>,
}

impl AverageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The averager for `metric_id`, created on first use.
    pub fn averager(&self, metric_id: &str) -> Arc<Averager> {
        let mut averagers = self.averagers.lock();
        if let Some(existing) = averagers.get(metric_id) {
            return Arc::clone(existing);
        }
        let fresh = Arc::new(Averager::new());
        averagers.insert(metric_id.to_string(), Arc::clone(&fresh));
        fresh
    }

    pub fn add(&self, metric_id: &str, value: f64) {
        self.averager(metric_id).add(value);
    }

    /// Drain every averager. Metrics whose window was empty are left out.
    pub fn drain(&self) -> Vec<(String, f64)> {
        let averagers: Vec<(String, Arc<Averager>)> = self
            .averagers
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        averagers
            .into_iter()
            .filter_map(|(metric, averager)| averager.take_mean().map(|mean| (metric, mean)))
            .collect()
    }

    pub fn metrics(&self) -> Vec<String> {
        self.averagers.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_get_is_zero() {
        let avg = Averager::new();
        assert_eq!(avg.get(), 0.0);
        assert!(avg.is_empty());
    }

    #[test]
    fn get_returns_mean_then_resets() {
        let avg = Averager::new();
        for v in [1.0, 2.0, 3.0, 6.0] {
            avg.add(v);
        }
        assert_eq!(avg.get(), 3.0);
        assert_eq!(avg.get(), 0.0);
    }

    #[test]
    fn concurrent_adds_are_all_counted() {
        let avg = Arc::new(Averager::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let avg = Arc::clone(&avg);
                thread::spawn(move || {
                    for _ in 0..250 {
                        avg.add(2.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(avg.len(), 1000);
        assert_eq!(avg.get(), 2.0);
    }

    #[test]
    fn table_creates_lazily_and_drains_non_empty() {
        let table = AverageTable::new();
        table.add("hr", 60.0);
        table.add("hr", 70.0);
        let _idle = table.averager("spo2");
        let mut drained = table.drain();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(drained, vec![("hr".to_string(), 65.0)]);
        assert!(table.drain().is_empty());
        assert_eq!(table.metrics().len(), 2);
    }
}
