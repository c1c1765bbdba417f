use thiserror::Error;
use uuid::Uuid;

/// Why a submitted job was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Set {set_id} ({path}) declares no compatible printer profiles")]
    NoProfiles { set_id: Uuid, path: String },

    #[error("Set {set_id} ({path}) requires profiles {profiles:?} but no printer advertises any of them")]
    NoMatchingPrinter {
        set_id: Uuid,
        path: String,
        profiles: Vec<String>,
    },

    #[error("Set {set_id} ({path}) is stored on SD card and cannot be shared")]
    SdCardFile { set_id: Uuid, path: String },

    #[error("Set {set_id} ({path}) does not resolve to a local file")]
    MissingFile { set_id: Uuid, path: String },

    #[error("Set {set_id} ({path}) has remaining {remaining} outside 0..={count}")]
    InvalidCount {
        set_id: Uuid,
        path: String,
        count: u32,
        remaining: u32,
    },
}

#[derive(Error, Debug)]
pub enum BedloopError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Rank computation exceeded maximum depth")]
    RankDepthExceeded,

    #[error("Invalid rank interval: {0}")]
    InvalidRank(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Set not found: {0}")]
    SetNotFound(Uuid),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("No queue is currently active")]
    NoActiveQueue,

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BedloopError>;
