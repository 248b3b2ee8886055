//! JSON directory snapshots.
//!
//! A snapshot file is a JSON array of `{ "id": ..., "payload": ... }` entries
//! where `payload` is a native payload tagged with its directory.

use std::path::Path;

use contactsync_directory::ids::NativeId;
use contactsync_directory::memory::InMemoryDirectory;
use contactsync_directory::payload::NativePayload;
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: NativeId,
    pub payload: NativePayload,
}

fn snapshot_error(path: &Path, message: impl Into<String>) -> CliError {
    CliError::Snapshot {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// Read a snapshot into an in-memory directory of `kind`.
pub async fn load(path: &Path, kind: DirectoryKind) -> CliResult<InMemoryDirectory> {
    let content = std::fs::read_to_string(path)?;
    let entries: Vec<SnapshotEntry> =
        serde_json::from_str(&content).map_err(|e| snapshot_error(path, e.to_string()))?;

    if let Some(entry) = entries.iter().find(|e| e.payload.kind() != kind) {
        return Err(snapshot_error(
            path,
            format!("record {} is a {} payload, expected {kind}", entry.id, entry.payload.kind()),
        ));
    }

    InMemoryDirectory::with_records(kind, entries.into_iter().map(|e| (e.id, e.payload)))
        .await
        .map_err(|e| snapshot_error(path, e.to_string()))
}

/// Write the live records of `directory` as a snapshot.
pub async fn save(path: &Path, directory: &InMemoryDirectory) -> CliResult<()> {
    let entries: Vec<SnapshotEntry> = directory
        .snapshot()
        .await
        .into_iter()
        .filter_map(|record| {
            record.payload.map(|payload| SnapshotEntry {
                id: record.native_id,
                payload,
            })
        })
        .collect();
    let json = serde_json::to_string_pretty(&entries)
        .map_err(|e| snapshot_error(path, e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MESSAGING: &str = r#"[
        {"id": "m1", "payload": {"directory": "messaging", "first_name": "Ada", "phone": "+441234567890"}},
        {"id": "m2", "payload": {"directory": "messaging", "first_name": "Alan"}}
    ]"#;

    fn write(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_snapshot() {
        let file = write(MESSAGING);
        let directory = load(file.path(), DirectoryKind::Messaging).await.unwrap();
        assert_eq!(directory.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_payload_of_other_directory() {
        let file = write(MESSAGING);
        let err = load(file.path(), DirectoryKind::Cloud).await.unwrap_err();
        assert!(matches!(err, CliError::Snapshot { .. }));
    }

    #[tokio::test]
    async fn test_rejects_malformed_json() {
        let file = write("{not json");
        let err = load(file.path(), DirectoryKind::Messaging).await.unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let file = write(MESSAGING);
        let directory = load(file.path(), DirectoryKind::Messaging).await.unwrap();

        let out = NamedTempFile::new().unwrap();
        save(out.path(), &directory).await.unwrap();
        let reloaded = load(out.path(), DirectoryKind::Messaging).await.unwrap();
        assert_eq!(
            reloaded.get(&NativeId::new("m1")).await,
            directory.get(&NativeId::new("m1")).await
        );
    }
}
