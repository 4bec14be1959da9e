//! Cluster records: the durable output of an allocation.
//!
//! A [`ClusterRecord`] serialises to a self-describing JSON document and
//! parses back to an identical value. Records are written to a
//! [`ClusterSink`] and made visible to the allocation body through the
//! scoped current-cluster slot in [`context`].

pub mod context;
mod id;

use std::io::{self, Write};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::NodeResult;

pub use context::{CLUSTER_ENV_VAR, ClusterContext, ClusterScope, current_cluster};
pub use id::ClusterId;

/// Schema version written into every record.
pub const CLUSTER_CONVENTION: u32 = 1;

/// File consulted by [`ClusterRecord::locate`] when nothing else names a
/// cluster.
pub const DEFAULT_RECORD_FILE: &str = "covey.json";

/// Sentinel accepted by [`ClusterSink::from_str`] for standard output.
pub const STDOUT_SINK: &str = "-";

/// Durable description of an allocated cluster.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClusterRecord {
    /// Schema version of the record.
    pub convention: u32,
    /// Identifier of the allocation attempt.
    pub identity: ClusterId,
    /// Backend that allocated the cluster.
    pub driver: DriverDetails,
    /// Allocated nodes in declared order.
    pub nodes: IndexMap<String, NodeResult>,
    /// When, where, and how long the allocation took.
    pub allocation: AllocationDetails,
}

/// Backend identification stored in a record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DriverDetails {
    /// Registered backend name.
    pub name: String,
}

/// Allocation metadata stored in a record.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AllocationDetails {
    /// Start of the allocation as an RFC 3339 timestamp.
    pub timestamp: String,
    /// Start of the allocation in seconds since the Unix epoch.
    pub utc: i64,
    /// Host name of the machine that ran the allocation.
    pub host: String,
    /// Wall-clock allocation time in seconds.
    pub duration: f64,
}

/// Errors raised while reading, writing, or locating records.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecordError {
    /// Raised when a record cannot be encoded.
    #[error("failed to serialise cluster record: {message}")]
    Serialise {
        /// Encoder error.
        message: String,
    },
    /// Raised when a document is not a valid record.
    #[error("failed to parse cluster record: {message}")]
    Parse {
        /// Parser error.
        message: String,
    },
    /// Raised when a record file or stream cannot be accessed.
    #[error("cluster record I/O failed at {path}: {message}")]
    Io {
        /// Path or sink that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a record has no node with the requested name.
    #[error("no node named {name} in cluster; options: {options:?}")]
    UnknownNode {
        /// Requested node name.
        name: String,
        /// Node names present in the record.
        options: Vec<String>,
    },
    /// Raised when no cluster could be located.
    #[error("no cluster found: {message}")]
    NotFound {
        /// Guidance on how to name a cluster.
        message: String,
    },
}

impl ClusterRecord {
    /// Serialises the record as compact JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Serialise`] when encoding fails or a node's
    /// extensions shadow one of its named fields.
    pub fn to_json(&self) -> Result<String, RecordError> {
        for (name, node) in &self.nodes {
            node.validate().map_err(|err| RecordError::Serialise {
                message: format!("node {name}: {err}"),
            })?;
        }
        serde_json::to_string(self).map_err(|err| RecordError::Serialise {
            message: err.to_string(),
        })
    }

    /// Parses a record from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Parse`] when `json` is not a record.
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        serde_json::from_str(json).map_err(|err| RecordError::Parse {
            message: err.to_string(),
        })
    }

    /// Looks up a node by name.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::UnknownNode`] listing the available names.
    pub fn node(&self, name: &str) -> Result<&NodeResult, RecordError> {
        self.nodes.get(name).ok_or_else(|| RecordError::UnknownNode {
            name: name.to_owned(),
            options: self.nodes.keys().cloned().collect(),
        })
    }

    /// Reads a record from a file.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Io`] when the file cannot be read and
    /// [`RecordError::Parse`] when it is not a record.
    pub fn load(path: &Utf8Path) -> Result<Self, RecordError> {
        let (dir, file_name) = open_parent(path, false)?;
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| io_error(path, &err))?;
        Self::from_json(&contents)
    }

    /// Finds the record an operation should act on.
    ///
    /// Tries, in order: `explicit`, the current cluster (slot or
    /// [`CLUSTER_ENV_VAR`]), then [`DEFAULT_RECORD_FILE`] in the working
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::NotFound`] when no source names a cluster, or
    /// the load and parse errors of the source that does.
    pub fn locate(explicit: Option<&Utf8Path>) -> Result<Self, RecordError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(serialized) = current_cluster() {
            return Self::from_json(&serialized);
        }

        let fallback = Utf8Path::new(DEFAULT_RECORD_FILE);
        let cwd = Dir::open_ambient_dir(".", ambient_authority())
            .map_err(|err| io_error(Utf8Path::new("."), &err))?;
        if cwd
            .try_exists(DEFAULT_RECORD_FILE)
            .map_err(|err| io_error(fallback, &err))?
        {
            return Self::load(fallback);
        }

        Err(RecordError::NotFound {
            message: format!(
                "pass a record path, set {CLUSTER_ENV_VAR}, or write {DEFAULT_RECORD_FILE} with --cluster-out"
            ),
        })
    }
}

/// Destination for a serialised record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterSink {
    /// Write the record as one line on standard output.
    Stdout,
    /// Overwrite the file at the given path.
    File(Utf8PathBuf),
}

impl ClusterSink {
    /// Writes `serialized` to the sink.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Io`] when the destination cannot be written.
    pub fn write(&self, serialized: &str) -> Result<(), RecordError> {
        match self {
            Self::Stdout => {
                let mut out = io::stdout().lock();
                writeln!(out, "{serialized}")
                    .and_then(|()| out.flush())
                    .map_err(|err| io_error(Utf8Path::new(STDOUT_SINK), &err))
            }
            Self::File(path) => {
                let (dir, file_name) = open_parent(path, true)?;
                dir.write(file_name, serialized)
                    .map_err(|err| io_error(path, &err))
            }
        }
    }
}

impl FromStr for ClusterSink {
    type Err = RecordError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" => Err(RecordError::Io {
                path: Utf8PathBuf::new(),
                message: String::from("cluster output path is empty"),
            }),
            STDOUT_SINK => Ok(Self::Stdout),
            path => Ok(Self::File(Utf8PathBuf::from(path))),
        }
    }
}

fn open_parent(path: &Utf8Path, create: bool) -> Result<(Dir, &str), RecordError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| RecordError::Io {
        path: path.to_path_buf(),
        message: String::from("record path is missing a filename"),
    })?;

    if create {
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
    }
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    Ok((dir, file_name))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> RecordError {
    RecordError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
