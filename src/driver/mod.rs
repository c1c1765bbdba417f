//! The print-cycle state machine.
//!
//! # Components
//!
//! - [`state`]: actions, printer states, driver states and material matching
//! - [`machine`]: the [`Driver`] itself

pub mod machine;
pub mod state;

pub use machine::{Driver, DriverSnapshot};
pub use state::{materials_match, Action, DriverState, PrinterState, StatusType, Telemetry};
