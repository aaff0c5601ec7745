//! Scene files: a [`TopologySnapshot`] stored as JSON.
//!
//! Loading checks the snapshot's own consistency plus a few sanity limits;
//! collisions with nodes already in a topology are caught by the import.

use anyhow::Context;
use std::fs;

use crate::simulation::snapshot::TopologySnapshot;

const MAX_NODES: usize = 10000;

/// Error type for scene loading failures.
#[derive(Debug)]
pub enum SceneLoadError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
    WriteError(String),
}

impl std::fmt::Display for SceneLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SceneLoadError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            SceneLoadError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            SceneLoadError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            SceneLoadError::WriteError(msg) => write!(f, "Failed to write file: {}", msg),
        }
    }
}

impl std::error::Error for SceneLoadError {}

/// Load and validate a scene file.
///
/// # Parameters
///
/// * `path` - Path to the scene JSON file
///
/// # Returns
///
/// Parsed and validated snapshot or an error.
pub fn load_scene(path: &str) -> Result<TopologySnapshot, SceneLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| SceneLoadError::FileReadError(e.to_string()))?;
    parse_scene(&data)
}

pub fn parse_scene(data: &str) -> Result<TopologySnapshot, SceneLoadError> {
    let snapshot: TopologySnapshot = serde_json::from_str(data)
        .context("Invalid JSON format")
        .map_err(|e| SceneLoadError::ParseError(format!("{:#}", e)))?;

    validate_scene(&snapshot).map_err(SceneLoadError::ValidationError)?;
    Ok(snapshot)
}

/// Write a snapshot as pretty-printed JSON.
pub fn save_scene(path: &str, snapshot: &TopologySnapshot) -> Result<(), SceneLoadError> {
    let data = serde_json::to_string_pretty(snapshot)
        .context("Failed to serialize scene")
        .map_err(|e| SceneLoadError::WriteError(format!("{:#}", e)))?;
    fs::write(path, data)
        .with_context(|| format!("Failed to write file: {}", path))
        .map_err(|e| SceneLoadError::WriteError(e.to_string()))
}

/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_scene(snapshot: &TopologySnapshot) -> Result<(), String> {
    if snapshot.nodes.len() > MAX_NODES {
        return Err(format!("Scene has {} nodes, maximum is {}", snapshot.nodes.len(), MAX_NODES));
    }
    snapshot.validate().map_err(|e| e.to_string())
}
