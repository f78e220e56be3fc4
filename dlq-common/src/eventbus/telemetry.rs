use std::time::Instant;

use tracing::{field, info_span, Span};

use crate::metrics::{EVENTBUS_TRANSACTIONS, EVENTBUS_TRANSACTION_DURATION};

pub const RESULT_SUCCESS: &str = "Success";

/// Opens a transaction per processed message. Passed to handlers at construction.
pub trait Tracer: Send + Sync {
    fn start_transaction(&self, name: &str, kind: &str) -> Box<dyn Transaction>;
}

/// Finished when dropped.
pub trait Transaction: Send {
    fn set_result(&mut self, result: &str);

    /// Span the work of this transaction should be instrumented with.
    fn span(&self) -> Span {
        Span::none()
    }
}

/// Tracer backed by a `tracing` span and `metrics` counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTracer;

impl Tracer for MetricsTracer {
    fn start_transaction(&self, name: &str, kind: &str) -> Box<dyn Transaction> {
        Box::new(MetricsTransaction {
            span: info_span!("transaction", transaction = name, kind = kind, result = field::Empty),
            name: name.to_owned(),
            kind: kind.to_owned(),
            started: Instant::now(),
            result: None,
        })
    }
}

struct MetricsTransaction {
    span: Span,
    name: String,
    kind: String,
    started: Instant,
    result: Option<String>,
}

impl Transaction for MetricsTransaction {
    fn set_result(&mut self, result: &str) {
        self.span.record("result", result);
        self.result = Some(result.to_owned());
    }

    fn span(&self) -> Span {
        self.span.clone()
    }
}

impl Drop for MetricsTransaction {
    fn drop(&mut self) {
        let outcome = match self.result.as_deref() {
            Some(RESULT_SUCCESS) => "success",
            Some(_) => "failure",
            None => "unknown",
        };
        let labels = [
            ("name", self.name.clone()),
            ("kind", self.kind.clone()),
            ("outcome", outcome.to_owned()),
        ];

        metrics::counter!(EVENTBUS_TRANSACTIONS, &labels).increment(1);
        metrics::histogram!(EVENTBUS_TRANSACTION_DURATION, &labels)
            .record(self.started.elapsed().as_secs_f64());
    }
}
