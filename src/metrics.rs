//! Prometheus counters shared process-wide.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "qwed_requests_total",
        "Verification requests by kind and verdict",
        &["kind", "verdict"],
    )
});

pub static BLOCKED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "qwed_blocked_total",
        "Requests blocked at admission, by layer",
        &["layer"],
    )
});

pub static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("qwed_rate_limited_total", "Requests rejected by the rate limiter")
});

pub static PROVIDER_FAILOVERS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "qwed_provider_failovers_total",
        "Provider failovers by provider name",
        &["provider"],
    )
});

pub static REFLECTION_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "qwed_reflection_attempts_total",
        "Translator retries driven by engine diagnostics",
    )
});

pub static CACHE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "qwed_cache_events_total",
        "Verification cache hits and misses",
        &["outcome"],
    )
});

pub static SANDBOX_FALLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "qwed_sandbox_fallbacks_total",
        "Stats executions that ran on the restricted fallback evaluator",
    )
});

pub static INFLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("qwed_inflight_requests", "Requests currently being served")
        .expect("static gauge");
    let _ = REGISTRY.register(Box::new(gauge.clone()));
    gauge
});

pub static REQUEST_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new("qwed_request_latency_seconds", "End-to-end request latency")
            .buckets(vec![0.005, 0.05, 0.25, 1.0, 5.0, 15.0, 30.0]),
    )
    .expect("static histogram");
    let _ = REGISTRY.register(Box::new(histogram.clone()));
    histogram
});

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name.to_string(), help.to_string()).expect("static counter");
    let _ = REGISTRY.register(Box::new(counter.clone()));
    counter
}

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter =
        IntCounterVec::new(Opts::new(name, help), labels).expect("static counter vec");
    let _ = REGISTRY.register(Box::new(counter.clone()));
    counter
}

/// Render the registry in the text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::{Encoder, TextEncoder};
    // Touch the lazies so a scrape before any traffic still lists them.
    Lazy::force(&REQUESTS_TOTAL);
    Lazy::force(&BLOCKED_TOTAL);
    Lazy::force(&RATE_LIMITED_TOTAL);
    Lazy::force(&CACHE_EVENTS);
    Lazy::force(&INFLIGHT);
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
