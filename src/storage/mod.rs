//! Job/Set/Run data model and its persistence.

pub mod files;
pub mod gjob;
pub mod manifest;
pub mod model;
pub mod runs;
pub mod store;

pub use files::FileLocator;
pub use manifest::{JobManifest, SetManifest};
pub use model::{Job, JobRank, Run, RunResult, Set};
pub use runs::RunLog;
pub use store::JobStore;
