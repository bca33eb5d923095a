//! Fingerprints identify "the same operation" for caching and merging.
//!
//! Each fingerprint is a SHA-256 over the semantically relevant fields,
//! separated by NUL so that adjacent fields cannot run into each other.
//! Labels live in a `BTreeMap`, so they are always hashed in sorted order.

use crate::domain::request::{AllocateQuotaRequest, CheckRequest};
use crate::domain::{Labels, MetricValue, Operation};
use sha2::{Digest, Sha256};
use std::fmt;

const DELIMITER: &[u8] = b"\0";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..12])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

struct SignatureBuilder(Sha256);

impl SignatureBuilder {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn field(mut self, value: &str) -> Self {
        self.0.update(value.as_bytes());
        self.0.update(DELIMITER);
        self
    }

    fn labels(mut self, labels: &Labels) -> Self {
        for (key, value) in labels {
            self = self.field(key).field(value);
        }
        self
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

/// Cache key for a check call. Metric names and metric labels participate
/// because they can change the verdict.
pub fn check_request_signature(request: &CheckRequest) -> Fingerprint {
    let op = &request.operation;
    let mut builder = SignatureBuilder::new()
        .field(&request.service_name)
        .field(&op.consumer_id)
        .field(&op.operation_name)
        .labels(&op.labels);
    for set in &op.metric_value_sets {
        builder = builder.field(&set.metric_name);
        for value in &set.metric_values {
            builder = builder.labels(&value.labels).field("");
        }
    }
    builder.finish()
}

/// Cache key for a quota allocation.
pub fn quota_request_signature(request: &AllocateQuotaRequest) -> Fingerprint {
    let op = &request.allocate_operation;
    SignatureBuilder::new()
        .field(&request.service_name)
        .field(&op.method_name)
        .field(&op.consumer_id)
        .labels(&op.labels)
        .finish()
}

/// Merge key for a reported operation. The service envelope is part of the
/// key so an aggregate is always shipped under the envelope it arrived
/// with. The operation id is left out so that distinct calls of the same
/// method aggregate.
pub fn report_signature(service_name: &str, service_config_id: &str, operation: &Operation) -> Fingerprint {
    SignatureBuilder::new()
        .field(service_name)
        .field(service_config_id)
        .field(&operation.consumer_id)
        .field(&operation.operation_name)
        .labels(&operation.labels)
        .finish()
}

/// Merge key for a metric value inside one metric value set.
pub fn metric_value_signature(value: &MetricValue) -> Fingerprint {
    SignatureBuilder::new().labels(&value.labels).finish()
}
