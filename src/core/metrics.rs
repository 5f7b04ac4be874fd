use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Job and cache counters exposed at `/metrics`
#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    jobs_submitted: IntCounterVec,
    jobs_finished: IntCounterVec,
    cache_hits: IntCounter,
    deduplicated: IntCounter,
    job_duration: Histogram,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("scdata_hub".to_string()), None)?;

        let jobs_submitted = IntCounterVec::new(
            Opts::new("jobs_submitted_total", "Jobs placed on the queue"),
            &["kind"],
        )?;
        let jobs_finished = IntCounterVec::new(
            Opts::new("jobs_finished_total", "Jobs that reached a terminal state"),
            &["kind", "outcome"],
        )?;
        let cache_hits = IntCounter::new(
            "analysis_cache_hits_total",
            "Analysis requests answered from a stored result",
        )?;
        let deduplicated = IntCounter::new(
            "analysis_deduplicated_total",
            "Analysis requests attached to an identical in-flight job",
        )?;
        let job_duration = Histogram::with_opts(
            HistogramOpts::new("job_duration_seconds", "Wall time of background jobs")
                .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        )?;

        registry.register(Box::new(jobs_submitted.clone()))?;
        registry.register(Box::new(jobs_finished.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(deduplicated.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;

        Ok(Self {
            registry,
            jobs_submitted,
            jobs_finished,
            cache_hits,
            deduplicated,
            job_duration,
        })
    }

    pub fn job_submitted(&self, kind: &str) {
        self.jobs_submitted.with_label_values(&[kind]).inc();
    }

    pub fn job_finished(&self, kind: &str, succeeded: bool, elapsed: Duration) {
        let outcome = if succeeded { "success" } else { "failure" };
        self.jobs_finished.with_label_values(&[kind, outcome]).inc();
        self.job_duration.observe(elapsed.as_secs_f64());
    }

    pub fn cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn deduplicated(&self) {
        self.deduplicated.inc();
    }

    /// Prometheus text exposition
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
