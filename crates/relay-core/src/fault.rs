//! Fault taxonomy and the durable crash-record format.
//!
//! Every component reports faults into a single ingress channel with an
//! origin tag; the recovery controller decides escalation from the origin
//! alone. Crash records are the only durable artifact: append-only lines
//! read by operators, never by the running system.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a fault came from, which fully determines its escalation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultOrigin {
    /// Uncaught fault at process scope (task panic, unrecoverable error).
    ProcessFault,

    /// Fault scoped to session startup or a session's retry budget.
    SessionFault,

    /// Preventive restart: resource usage crossed the configured threshold.
    ResourceThreshold,
}

impl FaultOrigin {
    /// Fatal origins escalate to a full process restart; the rest go
    /// through the in-place partial-recovery routine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProcessFault | Self::ResourceThreshold)
    }
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ProcessFault => "process-fault",
            Self::SessionFault => "session-fault",
            Self::ResourceThreshold => "resource-threshold",
        };
        write!(f, "{label}")
    }
}

/// One reported fault, as it travels through the fault channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub origin: FaultOrigin,
    pub message: String,

    /// Free-form context blob (stack trace, source error chain, ...).
    pub context: String,

    pub at: DateTime<Utc>,
}

impl Fault {
    pub fn new(
        origin: FaultOrigin,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            origin,
            message: message.into(),
            context: context.into(),
            at: Utc::now(),
        }
    }

    pub fn process(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(FaultOrigin::ProcessFault, message, context)
    }

    pub fn session(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(FaultOrigin::SessionFault, message, context)
    }

    pub fn resource_threshold(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(FaultOrigin::ResourceThreshold, message, context)
    }
}

/// Immutable crash-log entry.
///
/// Rendered as `[<ISO8601 timestamp>] <origin>: <message>` followed by the
/// context blob and a blank line. Each record is written with a single
/// append so concurrent workers never interleave within a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecord {
    pub timestamp: DateTime<Utc>,
    pub origin: FaultOrigin,
    pub message: String,
    pub context: String,
}

impl CrashRecord {
    pub fn from_fault(fault: &Fault) -> Self {
        Self {
            timestamp: fault.at,
            origin: fault.origin,
            message: fault.message.clone(),
            context: fault.context.clone(),
        }
    }

    /// Renders the record in the durable on-disk format.
    pub fn render(&self) -> String {
        format!(
            "[{}] {}: {}\n{}\n\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.origin,
            self.message,
            self.context,
        )
    }
}
