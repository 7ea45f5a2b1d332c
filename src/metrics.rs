use axum::{body::Body, http::Request, response::Response};
use lazy_static::lazy_static;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use tracing::Span;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Simple request counter
    pub static ref INCOMING_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("incoming_requests", "The number of HTTP requests received"),
        &["http_method"]
    ).expect("metric can be created");
    // Request counter by status code
    pub static ref RESPONSE_CODE_COLLECTOR: IntCounterVec = IntCounterVec::new(
        Opts::new("outgoing_response", "The number of responses sent."),
        &["status_code"]
    ).expect("metric can be created");
    // Request histogram by response time
    pub static ref RESPONSE_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("response_time", "The time taken to respond to each request"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
        },
        &[],
    ).expect("metric can be created");
    // Byte range fetches issued for chunk blocks
    pub static ref CHUNK_FETCHES: IntCounter = IntCounter::new(
        "chunk_fetches", "The number of chunk block byte ranges fetched"
    ).expect("metric can be created");
    // Bytes fetched for chunk blocks
    pub static ref FETCHED_BYTES: IntCounter = IntCounter::new(
        "fetched_bytes", "The number of chunk bytes fetched"
    ).expect("metric can be created");
    // Chunk-grid cells read as fill because no chunk was stored
    pub static ref FILL_HOLE_CELLS: IntCounter = IntCounter::new(
        "fill_hole_cells", "The number of unstored chunk-grid cells read as fill"
    ).expect("metric can be created");
    // Manifest store lookups by result
    pub static ref MANIFEST_STORE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("manifest_store_lookups", "The number of manifest store lookups"),
        &["result"]
    ).expect("metric can be created");
}

pub fn register_metrics() {
    let collectors: [Box<dyn prometheus::core::Collector>; 7] = [
        Box::new(INCOMING_REQUESTS.clone()),
        Box::new(RESPONSE_CODE_COLLECTOR.clone()),
        Box::new(RESPONSE_TIME_COLLECTOR.clone()),
        Box::new(CHUNK_FETCHES.clone()),
        Box::new(FETCHED_BYTES.clone()),
        Box::new(FILL_HOLE_CELLS.clone()),
        Box::new(MANIFEST_STORE_LOOKUPS.clone()),
    ];
    for collector in collectors {
        if let Err(err) = REGISTRY.register(collector) {
            tracing::warn!("failed to register metric: {}", err);
        }
    }
}

/// Record a manifest store lookup as a hit or a miss.
pub fn record_store_lookup(hit: bool) {
    MANIFEST_STORE_LOOKUPS
        .with_label_values(&[if hit { "hit" } else { "miss" }])
        .inc();
}

pub async fn metrics_handler() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("failed to encode metrics: {}", err);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Increments the prometheus counter on all incoming requests, labelled by http method
pub fn request_counter(request: &Request<Body>, _span: &Span) {
    INCOMING_REQUESTS
        .with_label_values(&[&request.method().to_string().to_ascii_uppercase()])
        .inc();
}

/// Increment the prometheus counter on all outgoing responses, labelled by status code
pub fn record_response_metrics<B>(
    response: &Response<B>,
    latency: std::time::Duration,
    _span: &Span,
) {
    RESPONSE_CODE_COLLECTOR
        .with_label_values(&[response.status().as_str()])
        .inc();

    RESPONSE_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}
