use std::collections::HashMap;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use tracing::debug;

use super::MetricSender;

const NAMESPACE: &str = "pathwatch";

struct Family<T> {
    label_names: Vec<String>,
    vec: T,
}

/// Materializes statsd-style metrics as Prometheus gauges and counters.
///
/// Each metric name gets a vector registered on first use. The label set is
/// fixed by the tags of that first emission; later emissions with a
/// different set of keys are skipped.
pub struct PrometheusSender {
    registry: Registry,
    gauges: Mutex<HashMap<String, Family<GaugeVec>>>,
    counters: Mutex<HashMap<String, Family<CounterVec>>>,
}

impl PrometheusSender {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            gauges: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn record_gauge(&self, name: &str, value: f64, tags: &[String]) -> Result<()> {
        let (keys, values) = split_tags(tags);
        let mut gauges = self.gauges.lock();

        if !gauges.contains_key(name) {
            let opts = Opts::new(metric_name(name), format!("Gauge {name}.")).namespace(NAMESPACE);
            let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            let vec = GaugeVec::new(opts, &key_refs)?;
            self.registry.register(Box::new(vec.clone()))?;
            gauges.insert(
                name.to_string(),
                Family {
                    label_names: keys.clone(),
                    vec,
                },
            );
        }

        let Some(family) = gauges.get(name) else {
            return Ok(());
        };
        if family.label_names != keys {
            bail!("label set {keys:?} does not match {:?}", family.label_names);
        }

        let value_refs: Vec<&str> = values.iter().map(String::as_str).collect();
        family.vec.get_metric_with_label_values(&value_refs)?.set(value);
        Ok(())
    }

    fn record_count(&self, name: &str, value: f64, tags: &[String]) -> Result<()> {
        if value < 0.0 {
            bail!("negative counter increment {value}");
        }

        let (keys, values) = split_tags(tags);
        let mut counters = self.counters.lock();

        if !counters.contains_key(name) {
            let opts = Opts::new(
                format!("{}_total", metric_name(name)),
                format!("Counter {name}."),
            )
            .namespace(NAMESPACE);
            let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            let vec = CounterVec::new(opts, &key_refs)?;
            self.registry.register(Box::new(vec.clone()))?;
            counters.insert(
                name.to_string(),
                Family {
                    label_names: keys.clone(),
                    vec,
                },
            );
        }

        let Some(family) = counters.get(name) else {
            return Ok(());
        };
        if family.label_names != keys {
            bail!("label set {keys:?} does not match {:?}", family.label_names);
        }

        let value_refs: Vec<&str> = values.iter().map(String::as_str).collect();
        family
            .vec
            .get_metric_with_label_values(&value_refs)?
            .inc_by(value);
        Ok(())
    }
}

impl PrometheusSender {
    /// Remove the series labelled by `tags` from every family with that label set.
    fn remove_series(&self, tags: &[String]) -> usize {
        let (keys, values) = split_tags(tags);
        let value_refs: Vec<&str> = values.iter().map(String::as_str).collect();
        let mut removed = 0;

        for family in self.gauges.lock().values() {
            if family.label_names == keys && family.vec.remove_label_values(&value_refs).is_ok() {
                removed += 1;
            }
        }
        for family in self.counters.lock().values() {
            if family.label_names == keys && family.vec.remove_label_values(&value_refs).is_ok() {
                removed += 1;
            }
        }

        removed
    }
}

impl MetricSender for PrometheusSender {
    fn gauge(&self, name: &str, value: f64, tags: &[String], _rate: f64) {
        if let Err(e) = self.record_gauge(name, value, tags) {
            debug!(metric = name, error = %e, "skipping gauge");
        }
    }

    fn count(&self, name: &str, value: f64, tags: &[String], _rate: f64) {
        if let Err(e) = self.record_count(name, value, tags) {
            debug!(metric = name, error = %e, "skipping counter");
        }
    }

    fn forget(&self, tags: &[String]) {
        let removed = self.remove_series(tags);
        debug!(?tags, removed, "removed metric series");
    }
}

/// Converts a dotted statsd name into a Prometheus metric name.
fn metric_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Splits `key:value` tags into label names and values.
///
/// Tags without a colon become a label with an empty value.
fn split_tags(tags: &[String]) -> (Vec<String>, Vec<String>) {
    let mut keys = Vec::with_capacity(tags.len());
    let mut values = Vec::with_capacity(tags.len());

    for tag in tags {
        let (k, v) = tag.split_once(':').unwrap_or((tag.as_str(), ""));
        keys.push(metric_name(k));
        values.push(v.to_string());
    }

    (keys, values)
}

#[cfg(test)]
mod tests {
    use prometheus::{Encoder, TextEncoder};

    use super::*;

    fn render(registry: &Registry) -> String {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .expect("encode");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn test_metric_name() {
        assert_eq!(
            metric_name("network_path.scheduler.flush_duration"),
            "network_path_scheduler_flush_duration"
        );
    }

    #[test]
    fn test_split_tags() {
        let tags = vec![
            "destination_hostname:abc".to_string(),
            "destination_port:80".to_string(),
            "bare".to_string(),
        ];
        let (keys, values) = split_tags(&tags);
        assert_eq!(keys, vec!["destination_hostname", "destination_port", "bare"]);
        assert_eq!(values, vec!["abc", "80", ""]);
    }

    #[test]
    fn test_gauge_with_labels() {
        let sender = PrometheusSender::new(Registry::new());
        let tags = vec!["protocol:udp".to_string()];
        sender.gauge("network_path.check_duration", 3.0, &tags, 1.0);
        sender.gauge("network_path.check_duration", 4.0, &tags, 1.0);

        let text = render(sender.registry());
        assert!(
            text.contains("pathwatch_network_path_check_duration{protocol=\"udp\"} 4"),
            "{text}"
        );
    }

    #[test]
    fn test_mismatched_labels_are_skipped() {
        let sender = PrometheusSender::new(Registry::new());
        sender.gauge("network_path.scheduler.workers", 4.0, &[], 1.0);
        sender.gauge(
            "network_path.scheduler.workers",
            8.0,
            &["extra:1".to_string()],
            1.0,
        );

        let text = render(sender.registry());
        assert!(text.contains("pathwatch_network_path_scheduler_workers 4"), "{text}");
    }

    #[test]
    fn test_forget_removes_destination_series() {
        let sender = PrometheusSender::new(Registry::new());
        let stale = vec![
            "destination_hostname:10.0.0.1".to_string(),
            "destination_port:443".to_string(),
        ];
        let live = vec![
            "destination_hostname:10.0.0.2".to_string(),
            "destination_port:443".to_string(),
        ];
        sender.gauge("network_path.path.monitored", 1.0, &stale, 1.0);
        sender.gauge("network_path.check_duration", 2.5, &stale, 1.0);
        sender.gauge("network_path.path.monitored", 1.0, &live, 1.0);
        sender.gauge("network_path.scheduler.workers", 4.0, &[], 1.0);

        assert_eq!(sender.remove_series(&stale), 2);
        assert_eq!(sender.remove_series(&stale), 0);

        let text = render(sender.registry());
        assert!(!text.contains("10.0.0.1"), "{text}");
        assert!(text.contains("destination_hostname=\"10.0.0.2\""), "{text}");
        assert!(text.contains("pathwatch_network_path_scheduler_workers 4"), "{text}");
    }

    #[test]
    fn test_count_accumulates() {
        let sender = PrometheusSender::new(Registry::new());
        let tags = vec!["reason:input_queue_full".to_string()];
        sender.count("network_path.scheduler.pathtest_dropped", 1.0, &tags, 1.0);
        sender.count("network_path.scheduler.pathtest_dropped", 2.0, &tags, 1.0);
        sender.count("network_path.scheduler.pathtest_dropped", -1.0, &tags, 1.0);

        let text = render(sender.registry());
        assert!(
            text.contains(
                "pathwatch_network_path_scheduler_pathtest_dropped_total{reason=\"input_queue_full\"} 3"
            ),
            "{text}"
        );
    }
}
