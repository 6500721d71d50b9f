use parking_lot::Mutex;

use super::MetricSender;

/// A single captured metric emission.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricCall {
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
    pub rate: f64,
}

impl MetricCall {
    pub fn new(name: &str, value: f64, tags: &[&str], rate: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            rate,
        }
    }
}

/// In-memory sender that records every call, for tests and debugging.
#[derive(Debug, Default)]
pub struct RecordingSender {
    gauges: Mutex<Vec<MetricCall>>,
    counts: Mutex<Vec<MetricCall>>,
    forgotten: Mutex<Vec<Vec<String>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge_calls(&self) -> Vec<MetricCall> {
        self.gauges.lock().clone()
    }

    pub fn count_calls(&self) -> Vec<MetricCall> {
        self.counts.lock().clone()
    }

    /// Tag sets passed to `forget`, in call order.
    pub fn forget_calls(&self) -> Vec<Vec<String>> {
        self.forgotten.lock().clone()
    }

    /// Gauge calls with the given name, in emission order.
    pub fn gauges_named(&self, name: &str) -> Vec<MetricCall> {
        self.gauges
            .lock()
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    /// Sum of all count calls with the given name.
    pub fn count_total(&self, name: &str) -> f64 {
        self.counts
            .lock()
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.value)
            .sum()
    }
}

impl MetricSender for RecordingSender {
    fn gauge(&self, name: &str, value: f64, tags: &[String], rate: f64) {
        self.gauges.lock().push(MetricCall {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
            rate,
        });
    }

    fn count(&self, name: &str, value: f64, tags: &[String], rate: f64) {
        self.counts.lock().push(MetricCall {
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
            rate,
        });
    }

    fn forget(&self, tags: &[String]) {
        self.forgotten.lock().push(tags.to_vec());
    }
}
