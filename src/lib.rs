//! # observatory
//!
//! Event telemetry pipeline for orchestrated agent work.
//!
//! Producers report what happened through the [`normalizer`], which turns
//! heterogeneous contexts into uniform, per-execution sequenced records,
//! persists them through an [`store::EventStore`] and hands them to the
//! [`hub`] for live fan-out with replay. The [`lifecycle`] tracker drives the
//! execution and wave state machines on top of the same path, and
//! [`history`] serves paginated reads.

pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod hub;
pub mod lifecycle;
pub mod model;
pub mod normalizer;
pub mod store;
pub mod telemetry;
