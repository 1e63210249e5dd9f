//! Filesystem metadata as a flat record of scalars.

use std::fs::Metadata;

use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// `stat(2)`-like metadata for a single filesystem entry.
///
/// Times are seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    /// File type and permission bits.
    pub st_mode: u32,
    /// Inode number.
    pub st_ino: u64,
    /// Device id.
    pub st_dev: u64,
    /// Hard link count.
    pub st_nlink: u64,
    /// Owner user id.
    pub st_uid: u32,
    /// Owner group id.
    pub st_gid: u32,
    /// Size in bytes.
    pub st_size: u64,
    /// Last access time.
    pub st_atime: f64,
    /// Last modification time.
    pub st_mtime: f64,
    /// Last status change time.
    pub st_ctime: f64,
}

impl FileStat {
    /// Capture metadata returned by `std::fs::metadata` or `symlink_metadata`.
    #[cfg(unix)]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        let seconds = |secs: i64, nanos: i64| secs as f64 + nanos as f64 / 1e9;
        Self {
            st_mode: metadata.mode(),
            st_ino: metadata.ino(),
            st_dev: metadata.dev(),
            st_nlink: metadata.nlink(),
            st_uid: metadata.uid(),
            st_gid: metadata.gid(),
            st_size: metadata.size(),
            st_atime: seconds(metadata.atime(), metadata.atime_nsec()),
            st_mtime: seconds(metadata.mtime(), metadata.mtime_nsec()),
            st_ctime: seconds(metadata.ctime(), metadata.ctime_nsec()),
        }
    }

    /// Capture metadata returned by `std::fs::metadata` or `symlink_metadata`.
    #[cfg(not(unix))]
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let seconds = |time: std::io::Result<SystemTime>| {
            time.ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map_or(0.0, |elapsed| elapsed.as_secs_f64())
        };
        let kind = if metadata.is_dir() { 0o040_000 } else { 0o100_000 };
        let perms = if metadata.permissions().readonly() { 0o444 } else { 0o666 };
        Self {
            st_mode: kind | perms,
            st_ino: 0,
            st_dev: 0,
            st_nlink: 1,
            st_uid: 0,
            st_gid: 0,
            st_size: metadata.len(),
            st_atime: seconds(metadata.accessed()),
            st_mtime: seconds(metadata.modified()),
            st_ctime: seconds(metadata.created()),
        }
    }

    /// Whether the mode bits describe a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.st_mode & 0o170_000 == 0o040_000
    }

    /// Encode as a map of scalars.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let field = |name: &str, value: Value| (Value::Text(name.to_string()), value);
        Value::Map(vec![
            field("st_mode", Value::Integer(self.st_mode.into())),
            field("st_ino", Value::Integer(self.st_ino.into())),
            field("st_dev", Value::Integer(self.st_dev.into())),
            field("st_nlink", Value::Integer(self.st_nlink.into())),
            field("st_uid", Value::Integer(self.st_uid.into())),
            field("st_gid", Value::Integer(self.st_gid.into())),
            field("st_size", Value::Integer(self.st_size.into())),
            field("st_atime", Value::Float(self.st_atime)),
            field("st_mtime", Value::Float(self.st_mtime)),
            field("st_ctime", Value::Float(self.st_ctime)),
        ])
    }

    /// Decode from a map produced by [`FileStat::to_value`].
    ///
    /// Extra keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing or not a number.
    pub fn from_value(value: &Value) -> Result<Self> {
        value
            .deserialized()
            .map_err(|e| CodecError::DeserializationFailed(e.to_string()).into())
    }
}
