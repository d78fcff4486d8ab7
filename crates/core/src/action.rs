//! Actions returned by behavior models.

use crate::event::{EventKind, EventPayload};
use crate::request::{CallOutcome, Operation};
use archsim_types::{CallId, ComponentId, RequestId};

/// Everything a behavior model can ask of the kernel.
///
/// Actions are **passive data**: models describe what should happen and the
/// kernel performs it (edge delivery, timeouts, retries, metrics). Models
/// never touch the event queue directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Schedule an event on the acting component after `delay_us`.
    Schedule {
        kind: EventKind,
        delay_us: u64,
        payload: EventPayload,
    },

    /// Send a child of `from` to `target` over the edge between them.
    ///
    /// The child's outcome comes back through `on_child_outcome`.
    Forward { from: CallId, target: ComponentId },

    /// Register a call owned by the acting component itself, so that it can
    /// forward work that no caller waits for (e.g. queue deliveries).
    Open {
        call: CallId,
        request: RequestId,
        op: Operation,
        key: String,
    },

    /// Finish a call at the acting component.
    Resolve { call: CallId, outcome: CallOutcome },

    /// Record an observation at the current time.
    Emit {
        kind: EventKind,
        request: Option<RequestId>,
        payload: EventPayload,
    },

    /// The request passed authentication at the acting component.
    Authenticate { request: RequestId },

    /// A write of `call` was applied to durable state.
    RecordWrite { call: CallId },
}

impl Action {
    pub fn after(kind: EventKind, delay_us: u64, payload: EventPayload) -> Self {
        Action::Schedule {
            kind,
            delay_us,
            payload,
        }
    }

    pub fn emit(kind: EventKind, payload: EventPayload) -> Self {
        Action::Emit {
            kind,
            request: None,
            payload,
        }
    }

    pub fn emit_for(kind: EventKind, request: RequestId, payload: EventPayload) -> Self {
        Action::Emit {
            kind,
            request: Some(request),
            payload,
        }
    }

    pub fn resolve(call: CallId, outcome: CallOutcome) -> Self {
        Action::Resolve { call, outcome }
    }

    pub fn forward(from: CallId, target: ComponentId) -> Self {
        Action::Forward { from, target }
    }

    /// Get a human-readable name for this action type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Schedule { .. } => "Schedule",
            Action::Forward { .. } => "Forward",
            Action::Open { .. } => "Open",
            Action::Resolve { .. } => "Resolve",
            Action::Emit { .. } => "Emit",
            Action::Authenticate { .. } => "Authenticate",
            Action::RecordWrite { .. } => "RecordWrite",
        }
    }
}
