pub mod config;
pub mod dashboard;
pub mod driver;
pub mod error;
pub mod node;
pub mod printer;
pub mod queue;
pub mod replication;
pub mod script;
pub mod shutdown;
pub mod storage;
