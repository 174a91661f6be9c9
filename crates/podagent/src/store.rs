//! Durable per-attachment config store.
//!
//! One JSON file per (pod, network) attachment under the store directory.
//! Each record keeps the last declared `Expected` operation next to the
//! `Running` state the reconciler last pushed into the dataplane, so the
//! agent can crash at any point and resume without corrupting an in-flight
//! attachment. `Running.Data` is the parameter set that was actually handed
//! to the plugin chain, which is what a later delete has to undo — not
//! whatever `Expected` holds by then.

use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::cni::CniParameters;

/// Default location of the persisted attachment records.
pub const DEFAULT_CONFIG_DIR: &str = "/var/run/podagent/configstore/";

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access config record at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no config record at {path}")]
    Missing { path: PathBuf },
    #[error("invalid config record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Optype {
    Add,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunningState {
    Nil,
    Active,
    Dirty,
}

/// The last observer-declared operation for an attachment.
///
/// `data` is present only when `optype` is [`Optype::Add`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedConfig {
    #[serde(rename = "Optype")]
    pub optype: Optype,
    #[serde(rename = "Data", default)]
    pub data: Option<CniParameters>,
}

/// The dataplane-facing side of a record.
///
/// Invariant: when `state` is `Dirty` or `Active`, `data` holds the exact
/// parameter set last passed to the plugin chain's add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningConfig {
    #[serde(rename = "State")]
    pub state: RunningState,
    #[serde(rename = "Data", default)]
    pub data: Option<CniParameters>,
}

impl Default for RunningConfig {
    fn default() -> Self {
        Self {
            state: RunningState::Nil,
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(rename = "Expected")]
    pub expected: ExpectedConfig,
    #[serde(rename = "Running")]
    pub running: RunningConfig,
}

/// File name of the record for one (pod, network) attachment.
pub fn record_key(pod_name: &str, network_name: &str) -> String {
    format!("{pod_name}-{network_name}.json")
}

/// Persistent key → [`ConfigRecord`] map backed by one file per key.
///
/// All operations serialize on a process-wide mutex; the mutex only spans
/// the disk read+write, never a plugin invocation.
pub struct ConfigStore {
    mu: Mutex<()>,
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            mu: Mutex::new(()),
            dir: dir.into(),
        }
    }

    /// Overwrite the `Expected` half of a record, creating the record (with
    /// `Running: Nil`) and the store directory when missing.
    pub fn save_expected(&self, key: &str, expected: ExpectedConfig) -> Result<(), StoreError> {
        debug!(key, ?expected, "Saving expected config");
        let _guard = self.mu.lock().unwrap();

        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.dir)
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.dir.join(key);
        let running = match read_record(&path) {
            Ok(record) => record.running,
            Err(StoreError::Missing { .. }) => RunningConfig::default(),
            // An unreadable record is exactly what this write repairs; the
            // running side it carried is unrecoverable either way.
            Err(e @ StoreError::Corrupt { .. }) => {
                warn!(key, "Replacing corrupt config record: {e}");
                RunningConfig::default()
            }
            Err(e) => return Err(e),
        };

        write_record(&path, &ConfigRecord { expected, running })
    }

    /// Overwrite the `Running` half of a record. The record must already
    /// exist; a missing file surfaces as [`StoreError::Missing`] (e.g. the
    /// pod was deleted while the reconciler was mid-flight).
    pub fn save_running(&self, key: &str, running: RunningConfig) -> Result<(), StoreError> {
        debug!(key, ?running, "Saving running config");
        let _guard = self.mu.lock().unwrap();

        let path = self.dir.join(key);
        let record = read_record(&path)?;

        write_record(
            &path,
            &ConfigRecord {
                expected: record.expected,
                running,
            },
        )
    }

    pub fn get(&self, key: &str) -> Result<ConfigRecord, StoreError> {
        let _guard = self.mu.lock().unwrap();
        let record = read_record(&self.dir.join(key))?;
        debug!(key, ?record, "Returning config record");
        Ok(record)
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        debug!(key, "Deleting config record");
        let _guard = self.mu.lock().unwrap();
        let path = self.dir.join(key);
        fs::remove_file(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => StoreError::Missing { path: path.clone() },
            _ => StoreError::Io {
                path: path.clone(),
                source,
            },
        })
    }

    /// Structural equality of the two parameter payloads; the drift check.
    pub fn is_config_same(&self, expected: &ExpectedConfig, running: &RunningConfig) -> bool {
        expected.data == running.data
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_DIR)
    }
}

fn read_record(path: &Path) -> Result<ConfigRecord, StoreError> {
    let bytes = fs::read(path).map_err(|source| match source.kind() {
        ErrorKind::NotFound => StoreError::Missing {
            path: path.to_path_buf(),
        },
        _ => StoreError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;

    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_record(path: &Path, record: &ConfigRecord) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(record).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    // Whole-file overwrite; a torn write surfaces as Corrupt on the next
    // read and is repaired by the next save_expected.
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(&bytes).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
