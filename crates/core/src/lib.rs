//! Gridflow core domain logic.
//!
//! Everything needed to run analytic worker processes and track the jobs
//! they belong to, with no HTTP or transport concerns:
//!
//! - [`progress`] -- progress frames and the line-oriented stdout decoder.
//! - [`worker`] -- worker specs, the supervisor, timeouts, and termination.
//! - [`ledger`] -- the per-domain authoritative job map.
//! - [`job_events`] -- the event envelope published on every transition.

pub mod domain;
pub mod error;
pub mod job;
pub mod job_events;
pub mod ledger;
pub mod progress;
pub mod types;
pub mod worker;
