//! Places finished artifacts somewhere retrievable and returns their URL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use animo_core::error::{AnimoError, Result};

/// Relocates a rendered file and returns its retrieval URL.
///
/// Publishing the same name twice overwrites the earlier artifact.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, local_path: &Path, name_hint: &str) -> Result<String>;
}

/// Moves artifacts into a directory served under `{base_url}/public/`.
pub struct LocalPublisher {
    public_dir: PathBuf,
    base_url: String,
}

impl LocalPublisher {
    pub fn new(public_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            public_dir: public_dir.into(),
            base_url: base_url.into(),
        }
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }
}

#[async_trait]
impl ArtifactPublisher for LocalPublisher {
    async fn publish(&self, local_path: &Path, name_hint: &str) -> Result<String> {
        let file_name = artifact_file_name(local_path, name_hint);
        tokio::fs::create_dir_all(&self.public_dir)
            .await
            .map_err(|e| AnimoError::Publish(format!("create {}: {e}", self.public_dir.display())))?;

        let target = self.public_dir.join(&file_name);
        if tokio::fs::rename(local_path, &target).await.is_err() {
            // Cross-device moves need a copy.
            tokio::fs::copy(local_path, &target)
                .await
                .map_err(|e| AnimoError::Publish(format!("copy to {}: {e}", target.display())))?;
            let _ = tokio::fs::remove_file(local_path).await;
        }

        let url = format!("{}/public/{}", self.base_url.trim_end_matches('/'), file_name);
        info!(path = %target.display(), %url, "Artifact published locally");
        Ok(url)
    }
}

/// Uploads artifacts as block blobs into an Azure storage container.
pub struct AzureBlobPublisher {
    client: reqwest::Client,
    container_url: String,
    sas_token: Option<String>,
}

impl AzureBlobPublisher {
    pub fn new(container_url: impl Into<String>, sas_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            container_url: container_url.into(),
            sas_token,
        }
    }

    /// Public blob URL (no credentials).
    pub fn blob_url(&self, file_name: &str) -> String {
        format!("{}/{}", self.container_url.trim_end_matches('/'), file_name)
    }

    fn upload_url(&self, file_name: &str) -> String {
        let url = self.blob_url(file_name);
        match &self.sas_token {
            Some(sas) if !sas.is_empty() => format!("{url}?{}", sas.trim_start_matches('?')),
            _ => url,
        }
    }
}

#[async_trait]
impl ArtifactPublisher for AzureBlobPublisher {
    async fn publish(&self, local_path: &Path, name_hint: &str) -> Result<String> {
        let file_name = artifact_file_name(local_path, name_hint);
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|e| AnimoError::Publish(format!("read {}: {e}", local_path.display())))?;

        debug!(%file_name, bytes = body.len(), "Uploading artifact to blob storage");
        let response = self
            .client
            .put(self.upload_url(&file_name))
            .header("x-ms-blob-type", "BlockBlob")
            .header("content-type", content_type_for(local_path))
            .body(body)
            .send()
            .await
            .map_err(|e| AnimoError::Publish(format!("upload failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AnimoError::Publish(format!("upload returned {status}: {text}")));
        }

        let _ = tokio::fs::remove_file(local_path).await;
        let url = self.blob_url(&file_name);
        info!(%url, "Artifact uploaded");
        Ok(url)
    }
}

/// `{hint}.{ext}` with path separators stripped from the hint.
fn artifact_file_name(local_path: &Path, name_hint: &str) -> String {
    let stem: String = name_hint
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    let stem = stem.trim_start_matches('.');
    let stem = if stem.is_empty() { "artifact" } else { stem };
    match local_path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("gif") => "image/gif",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_file_name_strips_separators() {
        let path = Path::new("/tmp/job/GenScene.mp4");
        assert_eq!(artifact_file_name(path, "video-u1-demo-2"), "video-u1-demo-2.mp4");
        assert_eq!(artifact_file_name(path, "../../etc/x"), "_.._etc_x.mp4");
        assert_eq!(artifact_file_name(path, ""), "artifact.mp4");
    }

    #[test]
    fn test_azure_urls() {
        let publisher = AzureBlobPublisher::new(
            "https://acct.blob.core.windows.net/videos/",
            Some("?sv=1&sig=abc".into()),
        );
        assert_eq!(
            publisher.blob_url("v.mp4"),
            "https://acct.blob.core.windows.net/videos/v.mp4"
        );
        assert_eq!(
            publisher.upload_url("v.mp4"),
            "https://acct.blob.core.windows.net/videos/v.mp4?sv=1&sig=abc"
        );
    }

    #[tokio::test]
    async fn test_local_publish_moves_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        let publisher = LocalPublisher::new(&public, "http://localhost:8080/");

        for content in ["first", "second"] {
            let src = dir.path().join("GenScene.mp4");
            std::fs::write(&src, content).unwrap();
            let url = publisher.publish(&src, "video-u-p-1").await.unwrap();
            assert_eq!(url, "http://localhost:8080/public/video-u-p-1.mp4");
            assert!(!src.exists());
        }
        let published = std::fs::read_to_string(public.join("video-u-p-1.mp4")).unwrap();
        assert_eq!(published, "second");
    }

    #[tokio::test]
    async fn test_local_publish_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = LocalPublisher::new(dir.path().join("public"), "http://h");
        let err = publisher
            .publish(&dir.path().join("absent.mp4"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, AnimoError::Publish(_)));
    }
}
