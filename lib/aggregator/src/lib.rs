//! Core engine for the journal aggregation gateway.
//!
//! One logical "fetch journals for patient P" request fans out to a fixed set
//! of backend resources. Backends answer asynchronously by posting a callback
//! to the gateway, which multiplexes those callbacks into the per-correlation
//! event stream consumed by the client. The engine tracks how many responses
//! are expected, enforces the callback deadline, and guarantees exactly-once
//! termination across the callback, deadline, and client-disconnect paths.

pub mod channel;
pub mod deadline;
pub mod dispatch;
pub mod event;
pub mod logging;
pub mod registry;
pub mod service;
pub mod signaling;
pub mod state;

mod error;

pub use self::error::{Error, Result};
