use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const REQUEST_TIMEOUTS: MetricDef = MetricDef {
    name: "request.timeouts",
    metric_type: MetricType::Counter,
    description: "Requests abandoned after the request timeout",
};

pub const ACTION_FAILURES: MetricDef = MetricDef {
    name: "action.failures",
    metric_type: MetricType::Counter,
    description: "Scripts stopped by a failing requirement. Tagged with kind.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    REQUEST_TIMEOUTS,
    ACTION_FAILURES,
];
