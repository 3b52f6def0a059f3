//! Metrics definitions for the ingestor.

use shared::metrics_defs::{MetricDef, MetricType};

pub const FETCH_DURATION: MetricDef = MetricDef {
    name: "fetch.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a single market API request in seconds",
};

pub const FETCH_FAILED: MetricDef = MetricDef {
    name: "fetch.failed",
    metric_type: MetricType::Counter,
    description: "Number of market API requests that failed or returned a non-2xx status",
};

pub const RETRY_ATTEMPT: MetricDef = MetricDef {
    name: "retry.attempt",
    metric_type: MetricType::Counter,
    description: "Number of attempts made under the retry policy",
};

pub const RETRY_EXHAUSTED: MetricDef = MetricDef {
    name: "retry.exhausted",
    metric_type: MetricType::Counter,
    description: "Number of operations that failed on every allowed attempt",
};

pub const ITEMS_MALFORMED: MetricDef = MetricDef {
    name: "extract.items.malformed",
    metric_type: MetricType::Counter,
    description: "Number of requested items whose fragment could not be decoded",
};

pub const ITEMS_MISSING: MetricDef = MetricDef {
    name: "extract.items.missing",
    metric_type: MetricType::Counter,
    description: "Number of requested items absent from the response",
};

pub const BATCH_SUCCEEDED: MetricDef = MetricDef {
    name: "pipeline.batch.succeeded",
    metric_type: MetricType::Counter,
    description: "Number of batches fetched and committed for every partition",
};

pub const BATCH_FAILED: MetricDef = MetricDef {
    name: "pipeline.batch.failed",
    metric_type: MetricType::Counter,
    description: "Number of batches with at least one failed partition or commit",
};

pub const RUN_DURATION: MetricDef = MetricDef {
    name: "pipeline.run.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a full pass over the catalog in seconds",
};

pub const STORE_RECORDS_UPSERTED: MetricDef = MetricDef {
    name: "store.records.upserted",
    metric_type: MetricType::Counter,
    description: "Number of item records committed to the store",
};

pub const STORE_COMMIT_FAILED: MetricDef = MetricDef {
    name: "store.commit.failed",
    metric_type: MetricType::Counter,
    description: "Number of collection transactions that were aborted",
};

pub const ALL_METRICS: &[MetricDef] = &[
    FETCH_DURATION,
    FETCH_FAILED,
    RETRY_ATTEMPT,
    RETRY_EXHAUSTED,
    ITEMS_MALFORMED,
    ITEMS_MISSING,
    BATCH_SUCCEEDED,
    BATCH_FAILED,
    RUN_DURATION,
    STORE_RECORDS_UPSERTED,
    STORE_COMMIT_FAILED,
];
