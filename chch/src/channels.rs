//! Loads the fixed channel set from a directory of channel files.
//!
//! Each regular, non-hidden file contributes its stem as a channel name; file
//! contents are ignored.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Directory scanned when no `--channels` flag is given.
pub const DEFAULT_CHANNEL_DIR: &str = "channels";

#[derive(Debug, Error)]
pub enum ChannelSourceError {
    #[error("failed to read channel directory {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no channel files found in {path}")]
    Empty { path: PathBuf },
}

/// Returns the sorted, de-duplicated channel names found in `dir`.
pub fn load_channel_names(dir: &Path) -> Result<Vec<String>, ChannelSourceError> {
    let read_error = |source| ChannelSourceError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_error)? {
        let entry = entry.map_err(read_error)?;
        if !entry.file_type().map_err(read_error)?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        // Names travel as single protocol tokens.
        if stem.is_empty() || stem.starts_with('.') || stem.contains(char::is_whitespace) {
            continue;
        }
        names.push(stem.to_string());
    }

    names.sort();
    names.dedup();
    if names.is_empty() {
        return Err(ChannelSourceError::Empty {
            path: dir.to_path_buf(),
        });
    }
    Ok(names)
}
