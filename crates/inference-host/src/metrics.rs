//! Prometheus counters for the model lifecycle. Recording never fails a call.

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static LOADS: OnceLock<Option<IntCounterVec>> = OnceLock::new();
static LOAD_SECONDS: OnceLock<Option<Histogram>> = OnceLock::new();
static LOADED: OnceLock<Option<IntGauge>> = OnceLock::new();
static UNLOADS: OnceLock<Option<IntCounter>> = OnceLock::new();

fn loads() -> Option<&'static IntCounterVec> {
    LOADS
        .get_or_init(|| {
            let c = IntCounterVec::new(
                prometheus::opts!("model_loads_total", "Model load attempts by backend and outcome"),
                &["backend", "outcome"],
            )
            .ok()?;
            REGISTRY.register(Box::new(c.clone())).ok();
            Some(c)
        })
        .as_ref()
}

fn load_seconds() -> Option<&'static Histogram> {
    LOAD_SECONDS
        .get_or_init(|| {
            let h = Histogram::with_opts(
                HistogramOpts::new("model_load_seconds", "Wall time of successful loads")
                    .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
            )
            .ok()?;
            REGISTRY.register(Box::new(h.clone())).ok();
            Some(h)
        })
        .as_ref()
}

fn loaded() -> Option<&'static IntGauge> {
    LOADED
        .get_or_init(|| {
            let g = IntGauge::new("model_loaded", "1 while a model is loaded").ok()?;
            REGISTRY.register(Box::new(g.clone())).ok();
            Some(g)
        })
        .as_ref()
}

fn unloads() -> Option<&'static IntCounter> {
    UNLOADS
        .get_or_init(|| {
            let c = IntCounter::new("model_unloads_total", "Unloads that released a model").ok()?;
            REGISTRY.register(Box::new(c.clone())).ok();
            Some(c)
        })
        .as_ref()
}

pub fn record_load(backend: &str, outcome: &str) {
    if let Some(counter) = loads() {
        counter.with_label_values(&[backend, outcome]).inc();
    }
}

pub fn observe_load_seconds(seconds: f64) {
    if let Some(histogram) = load_seconds() {
        histogram.observe(seconds);
    }
}

pub fn set_loaded(is_loaded: bool) {
    if let Some(gauge) = loaded() {
        gauge.set(is_loaded as i64);
    }
}

pub fn inc_unloads() {
    if let Some(counter) = unloads() {
        counter.inc();
    }
}

/// Text exposition format of every registered metric.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_load_is_exposed() {
        record_load("llama.cpp", "success");
        observe_load_seconds(1.5);
        set_loaded(true);
        inc_unloads();
        let text = gather_text();
        assert!(text.contains("model_loads_total"));
        assert!(text.contains("backend=\"llama.cpp\""));
        assert!(text.contains("model_load_seconds"));
        assert!(text.contains("model_unloads_total"));
    }
}
