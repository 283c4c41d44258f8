//! Per-query events observed by callers.

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::Record;

/// Everything a caller learns about one processed request. An emitted event
/// is immutable.
#[derive(Debug, Clone, Default)]
pub struct RequestProcessedEvent {
    /// Question name as the client sent it.
    pub domain: String,
    /// Question type, e.g. `"A"`.
    pub query_type: String,
    /// Wallclock time the request took.
    pub elapsed: Duration,
    /// Response code of the answer, e.g. `"NOERROR"`.
    pub status: String,
    /// Answer records, formatted by [`rr_list_to_string`].
    pub answer: String,
    /// Set when every upstream (and fallback) failed.
    pub error: Option<String>,
    /// Id of the upstream that produced the response.
    pub upstream_id: Option<i32>,
    pub cache_hit: bool,
    /// Whether the upstream answer carried DNSSEC signatures.
    pub dnssec: bool,
    /// Whether an exception rule let the query through.
    pub whitelist: bool,
    /// Ids of the filter lists whose rules shaped the decision.
    pub filter_list_ids: Vec<i32>,
    /// Texts of the effective rules.
    pub rules: Vec<String>,
}

/// Callback invoked with every processed request.
pub type EventSink = Arc<dyn Fn(RequestProcessedEvent) + Send + Sync>;

/// Format a record list as `<Type>, <rdata>` lines:
///
/// ```text
/// A, 1.2.3.4
/// AAAA, 12::34
/// CNAME, google.com.
/// ```
#[must_use]
pub fn rr_list_to_string(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.record_type().to_string());
        out.push_str(", ");
        out.push_str(&record.data().unwrap().to_string());
        out.push('\n');
    }
    out
}
