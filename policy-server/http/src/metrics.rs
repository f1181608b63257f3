use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct HttpMetrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Clone, Debug, Default)]
pub struct AuthMetrics {
    cache_hits: Counter,
    cache_misses: Counter,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    api: &'static str,
    route: &'static str,
    status: String,
}

// === impl HttpMetrics ===

impl HttpMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of HTTP requests handled",
            requests.clone(),
        );
        Self { requests }
    }

    pub(crate) fn record(&self, api: &'static str, route: &'static str, status: http::StatusCode) {
        self.requests
            .get_or_create(&RequestLabels {
                api,
                route,
                status: status.as_u16().to_string(),
            })
            .inc();
    }
}

// === impl AuthMetrics ===

impl AuthMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let cache_hits = Counter::default();
        reg.register(
            "token_cache_hits",
            "Total number of bearer tokens served from the cache",
            cache_hits.clone(),
        );
        let cache_misses = Counter::default();
        reg.register(
            "token_cache_misses",
            "Total number of bearer tokens sent for introspection",
            cache_misses.clone(),
        );
        Self {
            cache_hits,
            cache_misses,
        }
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub(crate) fn cache_miss(&self) {
        self.cache_misses.inc();
    }
}
