//! Request and call records.
//!
//! A [`Request`] is one unit of external work. Each visit of the request to
//! a component is a [`Call`]; calls form a tree rooted at the call on the
//! entry component. When the root call resolves and no call of the request is
//! still outstanding, the spans are sealed into a [`RequestTrace`].

use archsim_types::{CallId, ComponentId, EdgeId, RequestId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether a request reads or mutates state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    #[default]
    Read,
    Write,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

/// Shape of a new request, as drawn by the workload generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    pub op: Operation,
    pub key: String,
    pub user: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Terminal state of a call or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Success,
    Error,
    Timeout,
    Rejected,
}

impl RequestStatus {
    pub fn is_success(self) -> bool {
        self == RequestStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Timeout => "timeout",
            RequestStatus::Rejected => "rejected",
        }
    }
}

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOutcome {
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl CallOutcome {
    pub fn success() -> Self {
        Self {
            status: RequestStatus::Success,
            error_type: None,
        }
    }

    pub fn error(error_type: impl Into<String>) -> Self {
        Self {
            status: RequestStatus::Error,
            error_type: Some(error_type.into()),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: RequestStatus::Rejected,
            error_type: Some(reason.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: RequestStatus::Timeout,
            error_type: Some("timeout".to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Label used for error counters and retry matching.
    pub fn error_label(&self) -> &str {
        self.error_type.as_deref().unwrap_or(self.status.as_str())
    }
}

/// One visit of a request to one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: CallId,
    pub request: RequestId,
    pub component: ComponentId,
    /// Call that issued this one; `None` for the root call and for calls a
    /// component opens on its own behalf.
    pub parent: Option<CallId>,
    /// Edge the call travelled over.
    pub edge: Option<EdgeId>,
    /// Component that sent the call.
    pub caller: Option<ComponentId>,
    pub op: Operation,
    pub key: String,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub sent_at: SimTime,
    pub arrived_at: SimTime,
    pub started_at: Option<SimTime>,
    /// One-way network time before arrival.
    pub network_us: u64,
    pub replica: Option<usize>,
    /// The caller does not wait for the outcome (asynchronous edge).
    pub detached: bool,
    /// The caller stopped waiting (deadline passed); a late outcome is dropped.
    pub abandoned: bool,
    pub outcome: Option<CallOutcome>,
}

impl Call {
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Status of a span in a request trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// One call, as recorded in a request trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub component_id: ComponentId,
    pub operation_name: String,
    pub start_time: SimTime,
    pub end_time: SimTime,
    pub duration_ms: f64,
    pub queue_time_ms: f64,
    pub processing_time_ms: f64,
    pub network_time_ms: f64,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// A sealed request with its spans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTrace {
    pub trace_id: String,
    pub request_id: RequestId,
    pub start_time: SimTime,
    pub end_time: SimTime,
    pub total_duration_ms: f64,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    pub retries: u32,
    pub spans: Vec<TraceSpan>,
}

/// Mutable in-flight record of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub created_at: SimTime,
    pub spec: RequestSpec,
    pub attributes: BTreeMap<String, String>,
    pub root: CallId,
    /// Calls created but not yet resolved.
    pub outstanding: u32,
    pub retries: u32,
    pub outcome: Option<CallOutcome>,
    pub resolved_at: Option<SimTime>,
    /// Passed an authenticating gateway.
    pub authenticated: bool,
    pub spans: Vec<TraceSpan>,
}

impl Request {
    /// A request with its standard attributes filled from `spec`.
    pub fn new(id: RequestId, created_at: SimTime, spec: RequestSpec, root: CallId) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("key".to_string(), spec.key.clone());
        attributes.insert("user".to_string(), spec.user.clone());
        attributes.insert("op".to_string(), spec.op.as_str().to_string());
        attributes.insert("idempotencyKey".to_string(), id.to_string());
        if let Some(request_type) = &spec.request_type {
            attributes.insert("requestType".to_string(), request_type.clone());
        }
        for (name, value) in &spec.metadata {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            attributes.insert(name.clone(), text);
        }
        Self {
            id,
            created_at,
            spec,
            attributes,
            root,
            outstanding: 0,
            retries: 0,
            outcome: None,
            resolved_at: None,
            authenticated: false,
            spans: Vec::new(),
        }
    }

    /// Look up an attribute by name or by a `$.name` path.
    pub fn attribute(&self, path: &str) -> Option<&str> {
        let name = path.strip_prefix("$.").unwrap_or(path);
        self.attributes.get(name).map(String::as_str)
    }

    /// Root resolved and nothing left in flight.
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some() && self.outstanding == 0
    }

    /// Seal into a trace. Unresolved requests are reported as timed out.
    pub fn seal(self, now: SimTime) -> RequestTrace {
        let end_time = self.resolved_at.unwrap_or(now);
        let outcome = self.outcome.unwrap_or_else(CallOutcome::timeout);
        RequestTrace {
            trace_id: format!("trace-{}", self.id.0),
            request_id: self.id,
            start_time: self.created_at,
            end_time,
            total_duration_ms: archsim_types::micros_to_millis(end_time.micros_since(self.created_at)),
            status: outcome.status,
            error_details: outcome.error_type,
            retries: self.retries,
            spans: self.spans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RequestSpec {
        RequestSpec {
            op: Operation::Write,
            key: "key-3".into(),
            user: "user-1".into(),
            size_bytes: 512,
            request_type: Some("checkout".into()),
            metadata: BTreeMap::from([("tenant".to_string(), serde_json::json!("acme"))]),
        }
    }

    #[test]
    fn test_attributes_from_spec() {
        let request = Request::new(RequestId(4), SimTime::ZERO, spec(), CallId(1));
        assert_eq!(request.attribute("$.idempotencyKey"), Some("req-4"));
        assert_eq!(request.attribute("key"), Some("key-3"));
        assert_eq!(request.attribute("$.op"), Some("write"));
        assert_eq!(request.attribute("tenant"), Some("acme"));
        assert_eq!(request.attribute("missing"), None);
    }

    #[test]
    fn test_unresolved_request_seals_as_timeout() {
        let mut request = Request::new(RequestId(1), SimTime::from_millis(5), spec(), CallId(1));
        request.outstanding = 1;
        assert!(!request.is_complete());
        let trace = request.seal(SimTime::from_millis(25));
        assert_eq!(trace.status, RequestStatus::Timeout);
        assert_eq!(trace.total_duration_ms, 20.0);
    }

    #[test]
    fn test_error_label_falls_back_to_status() {
        assert_eq!(CallOutcome::error("db-down").error_label(), "db-down");
        let bare = CallOutcome {
            status: RequestStatus::Rejected,
            error_type: None,
        };
        assert_eq!(bare.error_label(), "rejected");
    }
}
