//! Plumbing between the driver and a physical printer.

pub mod backoff;
pub mod control;
pub mod ticker;

pub use backoff::ReconnectBackoff;
pub use control::{PrinterControl, WatchedFolderPrinter};
pub use ticker::Ticker;
