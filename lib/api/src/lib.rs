//! The Axum webserver for the journal aggregation gateway.
//!
//! Handler methods are grouped by routes that make up the REST API.

pub mod rest;
