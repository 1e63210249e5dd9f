//! Filesystem methods.

use std::fs::Metadata;
use std::io;
use std::path::Path;

use launchpad_rpc::{FileStat, MethodTable, Params, RemoteException, Value};
use tracing::debug;

/// Methods mounted under `fs`.
#[must_use]
pub fn methods() -> MethodTable {
    let mut methods = MethodTable::new();
    methods.register("enumerate_directory", |_session, params: Params| async move {
        let dir_path: String = params.parse(0, "dir_path")?;
        let listing = enumerate_directory(Path::new(&dir_path)).await;
        listing.map_err(|e| {
            RemoteException::from(e).with_attribute("filename", Value::Text(dir_path))
        })
    });
    methods
}

/// List `dir_path` as a map of entry name to its stat record.
///
/// Each record is a [`FileStat`] map with an extra `st_isdir` flag. Entries
/// that cannot be stat'ed map to null.
///
/// # Errors
///
/// Returns the I/O error if the directory itself cannot be read.
pub async fn enumerate_directory(dir_path: &Path) -> io::Result<Value> {
    let mut entries = tokio::fs::read_dir(dir_path).await?;
    let mut listing = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let record = match tokio::fs::metadata(entry.path()).await {
            Ok(metadata) => stat_record(&metadata),
            Err(e) => {
                debug!("Cannot stat {}: {}", name, e);
                Value::Null
            }
        };
        listing.push((name, record));
    }

    listing.sort_by(|(a, _), (b, _)| a.cmp(b));
    Ok(Value::Map(
        listing
            .into_iter()
            .map(|(name, record)| (Value::Text(name), record))
            .collect(),
    ))
}

fn stat_record(metadata: &Metadata) -> Value {
    let mut fields = FileStat::from_metadata(metadata)
        .to_value()
        .into_map()
        .unwrap_or_default();
    fields.push((
        Value::Text("st_isdir".to_string()),
        Value::Bool(metadata.is_dir()),
    ));
    Value::Map(fields)
}
