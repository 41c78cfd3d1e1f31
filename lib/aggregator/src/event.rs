//! Wire model shared by the dispatch, callback, and stream surfaces.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-generated identifier linking a client request to its backend
/// callbacks and its event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(transparent)]
#[repr(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    #[must_use]
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Allocates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, fmt)
    }
}

/// Outcome classification for a single backend slot.
///
/// The SCREAMING variants are the exact strings used on the wire by the
/// backends and the browser client; `ok` is lowercase for the same reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
pub enum CallbackStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CONNECTION_CLOSED")]
    ConnectionClosed,
    #[serde(rename = "ERROR")]
    Error,
    /// Terminal summary marker. Only ever produced by the gateway itself,
    /// never accepted from a backend.
    #[serde(rename = "COMPLETE")]
    Complete,
}

impl CallbackStatus {
    /// Whether this status counts towards the `errors` tally. Business
    /// rejections are deliberately excluded.
    #[must_use]
    pub const fn is_technical_failure(self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionClosed | Self::Error)
    }
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::Error => "ERROR",
            Self::Complete => "COMPLETE",
        };
        fmt.write_str(name)
    }
}

/// A single journal entry as returned by a backend resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct JournalNote {
    pub date: String,
    pub note: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub caregiver_id: String,
}

/// One backend outcome on the wire: posted by backends to the callback
/// endpoint, synthesized by the dispatcher for failed dispatches, and pushed
/// to the client over the event stream. The terminal summary is the same
/// record with [`CallbackStatus::Complete`] and the final counters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CallbackEvent {
    /// Backend identifier, or `"deadline"`/`"aggregator"` for gateway-made
    /// events.
    pub source: String,
    pub patient_id: String,
    pub correlation_id: CorrelationId,
    pub status: CallbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<JournalNote>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respondents: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,
}

impl CallbackEvent {
    /// A status-only event standing in for a callback that will never
    /// arrive, e.g. a dispatch rejection or a deadline miss.
    #[must_use]
    pub fn synthetic(
        source: impl Into<String>,
        patient_id: impl Into<String>,
        correlation_id: CorrelationId,
        status: CallbackStatus,
    ) -> Self {
        Self {
            source: source.into(),
            patient_id: patient_id.into(),
            correlation_id,
            status,
            notes: None,
            respondents: None,
            errors: None,
        }
    }

    /// The terminal event of a correlation's stream. Always carries both
    /// counters.
    #[must_use]
    pub fn summary(
        patient_id: impl Into<String>,
        correlation_id: CorrelationId,
        respondents: u32,
        errors: u32,
    ) -> Self {
        Self {
            source: "aggregator".to_owned(),
            patient_id: patient_id.into(),
            correlation_id,
            status: CallbackStatus::Complete,
            notes: None,
            respondents: Some(respondents),
            errors: Some(errors),
        }
    }
}
