//! tally-daemon library surface.
//!
//! `main.rs` stays thin; the router lives in [`routes`] and the shared
//! state in [`state`] so scenario tests can compose the bare router
//! against a temp store and a fake cloud.

pub mod api_types;
pub mod routes;
pub mod state;
