//! Application-level orchestration.
//!
//! This module owns the result delivery lifecycle (submit, watch, settle, cancel)
//! and post-outcome processing such as auto-save and exports. UI/CLI layers send
//! commands in and receive state changes back.

mod controller;
mod post_process;

pub use controller::{run_controller, ControllerEvent, ResultDeliveryController, UiCommand};
pub use post_process::{process_outcome, ProcessedOutcome};
