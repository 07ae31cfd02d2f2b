use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Counters, gauges and histograms for the ingestion path and the trigger
/// lifecycle, exported in Prometheus exposition format.
///
/// One instance is created at startup and shared through the application
/// state; nothing here is a process-global.
pub struct Metrics {
    registry: Registry,

    /// Accepted deliveries, per app
    pub webhook_received: IntCounterVec,
    /// Signature/timestamp rejections, per app
    pub verification_failed: IntCounterVec,
    /// Deliveries dropped as duplicates, per app
    pub dedup: IntCounterVec,
    /// Admission rejections, per scope ("ip" / "trigger")
    pub rate_limit_hit: IntCounterVec,
    /// Registration attempts, per app and result ("success" / "failure")
    pub registration: IntCounterVec,
    /// Renewal attempts, per app and result
    pub renewal: IntCounterVec,

    pub active_triggers: IntGauge,
    pub pending_events: IntGauge,

    /// End-to-end handler latency of accepted deliveries, per app
    pub processing_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let webhook_received = IntCounterVec::new(
            Opts::new("webhook_received_total", "Webhook deliveries accepted and persisted"),
            &["app"],
        )
        .expect("valid metric definition");
        let verification_failed = IntCounterVec::new(
            Opts::new(
                "webhook_verification_failed_total",
                "Webhook deliveries rejected during signature verification",
            ),
            &["app"],
        )
        .expect("valid metric definition");
        let dedup = IntCounterVec::new(
            Opts::new("webhook_dedup_total", "Webhook deliveries dropped as duplicates"),
            &["app"],
        )
        .expect("valid metric definition");
        let rate_limit_hit = IntCounterVec::new(
            Opts::new("rate_limit_hit_total", "Requests rejected by admission control"),
            &["scope"],
        )
        .expect("valid metric definition");
        let registration = IntCounterVec::new(
            Opts::new("trigger_registration_total", "Provider registration attempts"),
            &["app", "result"],
        )
        .expect("valid metric definition");
        let renewal = IntCounterVec::new(
            Opts::new("renewal_total", "Provider subscription renewal attempts"),
            &["app", "result"],
        )
        .expect("valid metric definition");

        let active_triggers =
            IntGauge::with_opts(Opts::new("active_triggers_count", "Triggers in ACTIVE status"))
                .expect("valid metric definition");
        let pending_events =
            IntGauge::with_opts(Opts::new("pending_events_count", "Events awaiting dispatch"))
                .expect("valid metric definition");

        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "webhook_processing_duration_seconds",
                "Ingestion handler latency for accepted deliveries",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["app"],
        )
        .expect("valid metric definition");

        registry.register(Box::new(webhook_received.clone())).expect("metric registers once");
        registry.register(Box::new(verification_failed.clone())).expect("metric registers once");
        registry.register(Box::new(dedup.clone())).expect("metric registers once");
        registry.register(Box::new(rate_limit_hit.clone())).expect("metric registers once");
        registry.register(Box::new(registration.clone())).expect("metric registers once");
        registry.register(Box::new(renewal.clone())).expect("metric registers once");
        registry.register(Box::new(active_triggers.clone())).expect("metric registers once");
        registry.register(Box::new(pending_events.clone())).expect("metric registers once");
        registry.register(Box::new(processing_duration.clone())).expect("metric registers once");

        Self {
            registry,
            webhook_received,
            verification_failed,
            dedup,
            rate_limit_hit,
            registration,
            renewal,
            active_triggers,
            pending_events,
            processing_duration,
        }
    }

    /// Encode all registered metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        let metrics = Metrics::new();
        metrics.webhook_received.with_label_values(&["GITHUB"]).inc();
        metrics.dedup.with_label_values(&["GITHUB"]).inc();
        metrics.rate_limit_hit.with_label_values(&["ip"]).inc();
        metrics.registration.with_label_values(&["SHOPIFY", "success"]).inc();
        metrics.active_triggers.set(7);
        metrics.processing_duration.with_label_values(&["GITHUB"]).observe(0.003);

        let text = metrics.encode();
        assert!(text.contains("webhook_received_total{app=\"GITHUB\"} 1"));
        assert!(text.contains("webhook_dedup_total{app=\"GITHUB\"} 1"));
        assert!(text.contains("rate_limit_hit_total{scope=\"ip\"} 1"));
        assert!(text.contains("trigger_registration_total{app=\"SHOPIFY\",result=\"success\"} 1"));
        assert!(text.contains("active_triggers_count 7"));
        assert!(text.contains("webhook_processing_duration_seconds_bucket"));
    }

    #[test]
    fn test_fresh_collector_encodes_gauges_only() {
        let metrics = Metrics::new();
        let text = metrics.encode();
        // Vec metrics with no observed label sets are absent until first use.
        assert!(text.contains("active_triggers_count 0"));
        assert!(!text.contains("webhook_received_total{"));
    }
}
