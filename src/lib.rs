//! Client for the hosted stock analysis service.
//!
//! A submission either completes immediately or leaves a job document behind
//! that is watched until it settles. [`orchestrator::ResultDeliveryController`]
//! guarantees one rendered outcome per request and at most one live watch.

pub mod cli;
pub mod error;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod render;
pub mod storage;
pub mod submission;
pub mod summary;
pub mod watch;
