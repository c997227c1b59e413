//! Error types for snapvault

use thiserror::Error;

/// Main error type for snapvault operations
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("Invalid lineage: {reason}")]
    Validation { reason: String },

    #[error("Reference node {node} never completed; a full backup is required")]
    StaleReference { node: String },

    #[error("Object write interrupted for {hash}: {reason}")]
    PartialWrite { hash: String, reason: String },

    #[error("Deletion blocked by surviving dependents: {reason}")]
    Dependency { reason: String },

    #[error("Restore chain broken: {reason}")]
    BrokenChain { reason: String },

    #[error("Destination {path} is locked by another run")]
    Busy { path: String },

    #[error("Transport failure: {reason}")]
    Transport { reason: String },

    #[error("Integrity verification failed: {reason}")]
    Integrity { reason: String },

    #[error("Object not found: {hash}")]
    ObjectNotFound { hash: String },

    #[error("Backup node not found: {id}")]
    NodeNotFound { id: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for snapvault operations
pub type Result<T> = std::result::Result<T, VaultError>;
