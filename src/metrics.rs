use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus instruments for number issuance.
#[derive(Clone)]
pub struct NumberingMetrics {
    registry: Registry,
    issued: IntCounterVec,
    resets: IntCounterVec,
    busy: IntCounterVec,
    allocation_seconds: HistogramVec,
}

impl NumberingMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let issued = IntCounterVec::new(
            Opts::new("document_numbers_issued_total", "Document numbers issued"),
            &["document_type"],
        )?;
        let resets = IntCounterVec::new(
            Opts::new("document_number_resets_total", "Administrative counter resets applied"),
            &["document_type"],
        )?;
        let busy = IntCounterVec::new(
            Opts::new("document_number_busy_total", "Allocations that hit counter contention"),
            &["document_type"],
        )?;
        let allocation_seconds = HistogramVec::new(
            HistogramOpts::new("document_number_allocation_seconds", "Time to allocate a number")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5]),
            &["document_type"],
        )?;

        registry.register(Box::new(issued.clone()))?;
        registry.register(Box::new(resets.clone()))?;
        registry.register(Box::new(busy.clone()))?;
        registry.register(Box::new(allocation_seconds.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))?;

        Ok(NumberingMetrics {
            registry,
            issued,
            resets,
            busy,
            allocation_seconds,
        })
    }

    pub fn record_issued(&self, document_type: &str, elapsed_secs: f64) {
        self.issued.with_label_values(&[document_type]).inc();
        self.allocation_seconds
            .with_label_values(&[document_type])
            .observe(elapsed_secs);
    }

    pub fn record_reset(&self, document_type: &str) {
        self.resets.with_label_values(&[document_type]).inc();
    }

    pub fn record_busy(&self, document_type: &str) {
        self.busy.with_label_values(&[document_type]).inc();
    }

    pub fn issued_count(&self, document_type: &str) -> u64 {
        self.issued.with_label_values(&[document_type]).get()
    }

    /// Text exposition format for `/metrics`.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_are_per_document_type() {
        let metrics = NumberingMetrics::new().unwrap();
        metrics.record_issued("paragon", 0.001);
        metrics.record_issued("paragon", 0.002);
        metrics.record_issued("faktura", 0.001);

        assert_eq!(metrics.issued_count("paragon"), 2);
        assert_eq!(metrics.issued_count("faktura"), 1);
    }

    #[test]
    fn test_render_exposes_counters() {
        let metrics = NumberingMetrics::new().unwrap();
        metrics.record_reset("faktura");
        metrics.record_busy("faktura");

        let text = metrics.render().unwrap();
        assert!(text.contains("document_number_resets_total{document_type=\"faktura\"} 1"));
        assert!(text.contains("document_number_busy_total"));
    }
}
