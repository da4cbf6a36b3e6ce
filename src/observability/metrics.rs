use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub offers_ignored_total: IntCounterVec,
    pub accept_latency_seconds: HistogramVec,
    pub heartbeats_total: IntCounterVec,
    pub stage_transitions_total: IntCounterVec,
    pub active_sessions: IntGauge,
    pub transport_reconnects_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Assignment offers by terminal outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let offers_ignored_total = IntCounterVec::new(
            Opts::new("offers_ignored_total", "Inbound offers dropped before display"),
            &["reason"],
        )
        .expect("valid offers_ignored_total metric");

        let accept_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "accept_latency_seconds",
                "Latency of accept requests against the order repository",
            ),
            &["result"],
        )
        .expect("valid accept_latency_seconds metric");

        let heartbeats_total = IntCounterVec::new(
            Opts::new("heartbeats_total", "Heartbeats sent by result"),
            &["result"],
        )
        .expect("valid heartbeats_total metric");

        let stage_transitions_total = IntCounterVec::new(
            Opts::new("stage_transitions_total", "Delivery stages entered"),
            &["stage"],
        )
        .expect("valid stage_transitions_total metric");

        let active_sessions = IntGauge::new("active_sessions", "Driver sessions currently open")
            .expect("valid active_sessions metric");

        let transport_reconnects_total = IntCounterVec::new(
            Opts::new(
                "transport_reconnects_total",
                "Realtime transport reconnect attempts by result",
            ),
            &["result"],
        )
        .expect("valid transport_reconnects_total metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(offers_ignored_total.clone()))
            .expect("register offers_ignored_total");
        registry
            .register(Box::new(accept_latency_seconds.clone()))
            .expect("register accept_latency_seconds");
        registry
            .register(Box::new(heartbeats_total.clone()))
            .expect("register heartbeats_total");
        registry
            .register(Box::new(stage_transitions_total.clone()))
            .expect("register stage_transitions_total");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(transport_reconnects_total.clone()))
            .expect("register transport_reconnects_total");

        Self {
            registry,
            offers_total,
            offers_ignored_total,
            accept_latency_seconds,
            heartbeats_total,
            stage_transitions_total,
            active_sessions,
            transport_reconnects_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
