//! Output sink: persist the final text to a file.
//!
//! Writes go to a sibling `*.tmp` file which is then renamed over the target,
//! so a reader never observes a half-written output. Missing parent
//! directories are created. An existing target is replaced (last writer wins);
//! no backup of the previous content is kept.

use crate::error::Doc2TextError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write `text` to `target` byte-for-byte.
pub async fn persist(text: &str, target: impl AsRef<Path>) -> Result<(), Doc2TextError> {
    let path = target.as_ref();
    let failed = |source: std::io::Error| Doc2TextError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }

    let tmp_path = tmp_sibling(path);
    tokio::fs::write(&tmp_path, text.as_bytes())
        .await
        .map_err(failed)?;

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(failed(e));
    }

    info!("Wrote {} bytes to {}", text.len(), path.display());
    Ok(())
}

/// `<dir>/<name>.tmp`, in the same directory so the rename stays on one filesystem.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("output"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.yaml");
        let text = "total: 12.50\r\nnote: \"ünïcödé\"  \n\n";
        persist(text, &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), text);
        assert!(!dir.path().join("out.yaml.tmp").exists());
    }

    #[tokio::test]
    async fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c/result.txt");
        persist("x", &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "x");
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("result.txt");
        persist("first version, longer", &target).await.unwrap();
        persist("second", &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
    }

    #[tokio::test]
    async fn unwritable_target_is_write_failed() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let err = persist("x", blocker.join("out.txt")).await.unwrap_err();
        assert!(matches!(err, Doc2TextError::WriteFailed { .. }));
    }

    #[test]
    fn tmp_sibling_keeps_directory() {
        assert_eq!(
            tmp_sibling(Path::new("/data/out.json")),
            PathBuf::from("/data/out.json.tmp")
        );
    }
}
