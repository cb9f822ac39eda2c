use std::path::Path;

/// Build a copy-on-write overlay rootfs at `dest` from `source`.
///
/// Each sandbox gets exactly one overlay built synchronously at create
/// time — there is no pre-warming pool. Tries a reflinked sparse copy
/// first; reflink is unsupported on some filesystems, so a plain sparse
/// copy is the fallback and must not fail create.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay copy failed: {0}")]
    CopyFailed(String),
}

pub async fn create_overlay(source: &Path, dest: &Path) -> Result<(), OverlayError> {
    let reflink = tokio::process::Command::new("cp")
        .arg("--reflink=auto")
        .arg("--sparse=always")
        .arg(source)
        .arg(dest)
        .output()
        .await
        .map_err(|e| OverlayError::CopyFailed(format!("cp --reflink=auto: {e}")))?;

    if reflink.status.success() {
        return Ok(());
    }

    let fallback = tokio::process::Command::new("cp")
        .arg("--sparse=always")
        .arg(source)
        .arg(dest)
        .output()
        .await
        .map_err(|e| OverlayError::CopyFailed(format!("cp --sparse=always: {e}")))?;

    if fallback.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&fallback.stderr);
    Err(OverlayError::CopyFailed(format!(
        "cp failed: {}",
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_source_contents() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("base-rootfs.ext4");
        let dest = dir.path().join("rootfs.ext4");
        tokio::fs::write(&source, b"fake ext4 contents")
            .await
            .unwrap();

        create_overlay(&source, &dest).await.unwrap();

        let contents = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(contents, b"fake ext4 contents");
    }

    #[tokio::test]
    async fn missing_source_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("missing.ext4");
        let dest = dir.path().join("rootfs.ext4");

        let err = create_overlay(&source, &dest).await.unwrap_err();
        assert!(matches!(err, OverlayError::CopyFailed(_)));
    }
}
