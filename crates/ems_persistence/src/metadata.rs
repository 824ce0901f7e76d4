//! Node metadata: the set of topics and channels (with their paused
//! flags) recreated at startup. Stored as JSON in `emsd.dat`, rewritten
//! atomically via tmp + rename.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::diskqueue::QueueError;

pub const METADATA_FILE: &str = "emsd.dat";

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub topics: Vec<TopicMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicMeta {
    pub name: String,
    pub paused: bool,
    pub channels: Vec<ChannelMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMeta {
    pub name: String,
    pub paused: bool,
}

pub fn metadata_path(data_dir: impl AsRef<Path>) -> PathBuf {
    data_dir.as_ref().join(METADATA_FILE)
}

/// Load node metadata; `None` on first boot.
pub fn load(data_dir: impl AsRef<Path>) -> Result<Option<Metadata>, QueueError> {
    let path = metadata_path(data_dir);
    let contents = match fs::read(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let meta = serde_json::from_slice(&contents)
        .map_err(|e| QueueError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok(Some(meta))
}

pub fn persist(data_dir: impl AsRef<Path>, meta: &Metadata) -> Result<(), QueueError> {
    let data_dir = data_dir.as_ref();
    fs::create_dir_all(data_dir)?;
    let path = metadata_path(data_dir);
    let tmp = data_dir.join(format!("{}.{}.tmp", METADATA_FILE, std::process::id()));
    let contents = serde_json::to_vec(meta)
        .map_err(|e| QueueError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    {
        let mut f = File::create(&tmp)?;
        f.write_all(&contents)?;
        f.sync_data()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}
