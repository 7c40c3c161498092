//! Bounded downloads and uploads
//!
//! Downloads stream to a scratch file under `<data_dir>/downloads`, announce
//! progress every 10 MiB, hand the file to the transport and delete it after
//! a short delay. Uploads stream an attachment from disk into the directory
//! the user is waiting on and then show the refreshed listing.

use crate::api::{AlistClient, Entry, CHUNK_SIZE};
use crate::config::Settings;
use crate::error::{NavError, NavResult};
use crate::format::{format_listing, format_size};
use crate::reply::Outbox;
use crate::session::SharedSession;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;

/// Progress granularity for large downloads.
pub const PROGRESS_STEP: u64 = 10 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".bmp"];
const MAX_SAFE_NAME: usize = 100;

/// Something the user sent while the bot was waiting for an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    File { name: String, path: PathBuf },
    Image { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub target_dir: String,
    pub filename: String,
}

impl UploadRequest {
    /// Files keep their name. Images are renamed `image_<unix_ts><ext>`,
    /// keeping a known image extension or falling back to `.jpg`.
    pub fn from_attachment(attachment: Attachment, target_dir: &str, now: DateTime<Utc>) -> Self {
        let (local_path, filename) = match attachment {
            Attachment::File { name, path } => (path, name),
            Attachment::Image { path } => {
                let ext = image_extension(&path);
                let filename = format!("image_{}{}", now.timestamp(), ext);
                (path, filename)
            }
        };
        Self {
            local_path,
            target_dir: target_dir.to_string(),
            filename,
        }
    }
}

fn image_extension(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
        ext
    } else {
        ".jpg".to_string()
    }
}

/// Keep alphanumerics and `._- `, at most 100 characters. Names left with
/// nothing but dots and spaces become `file`.
pub fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .take(MAX_SAFE_NAME)
        .collect();
    if cleaned.trim_matches(|c| c == '.' || c == ' ').is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

pub struct TransferOrchestrator {
    downloads_dir: PathBuf,
    max_download_bytes: u64,
    max_upload_bytes: u64,
    cleanup_delay: Duration,
}

impl TransferOrchestrator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            downloads_dir: settings.data_dir().join("downloads"),
            max_download_bytes: settings.max_download_bytes(),
            max_upload_bytes: settings.max_upload_bytes(),
            cleanup_delay: Duration::from_secs(settings.cleanup_delay_secs),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    fn scratch_path(&self, user_id: &str, name: &str) -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.downloads_dir.join(format!(
            "{}_{}_{}_{}",
            safe_name(user_id),
            Utc::now().timestamp(),
            &id[..8],
            safe_name(name)
        ))
    }

    /// Fetch `remote_path` and announce it as a [`Reply::File`](crate::reply::Reply).
    pub async fn download(
        &self,
        client: &AlistClient,
        user_id: &str,
        remote_path: &str,
        entry: &Entry,
        outbox: &Outbox,
    ) -> NavResult<PathBuf> {
        if entry.size > self.max_download_bytes {
            return Err(NavError::SizeExceeded {
                actual: entry.size,
                limit: self.max_download_bytes,
            });
        }

        let url = client
            .download_locator(remote_path)
            .await
            .ok_or_else(|| NavError::TransferError(format!("no download link for {}", remote_path)))?;

        outbox
            .text(format!("downloading {} ({})", entry.name, format_size(entry.size)))
            .await;

        let resp = client
            .open_download(&url)
            .await
            .ok_or_else(|| NavError::TransferError("server refused the download".to_string()))?;

        let dest = self.scratch_path(user_id, &entry.name);
        let written = match self.stream_to_file(resp, &dest, entry.size, outbox).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                tracing::error!("download of {} for {} failed: {:#}", remote_path, user_id, e);
                return Err(match e.downcast::<NavError>() {
                    Ok(nav) => nav,
                    Err(e) => NavError::TransferError(e.to_string()),
                });
            }
        };

        tracing::info!("downloaded {} for {} ({} bytes)", remote_path, user_id, written);
        outbox.file(&entry.name, dest.clone()).await;
        self.schedule_cleanup(dest.clone());
        Ok(dest)
    }

    async fn stream_to_file(
        &self,
        resp: reqwest::Response,
        dest: &Path,
        declared: u64,
        outbox: &Outbox,
    ) -> anyhow::Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(dest).await?;
        let mut writer = tokio::io::BufWriter::with_capacity(CHUNK_SIZE, file);

        let total = resp.content_length().filter(|n| *n > 0).unwrap_or(declared);
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        let mut steps_reported: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            // Listings can understate sizes; the limit holds for actual bytes.
            if written > self.max_download_bytes {
                return Err(NavError::SizeExceeded {
                    actual: written,
                    limit: self.max_download_bytes,
                }
                .into());
            }
            writer.write_all(&chunk).await?;

            if total > PROGRESS_STEP {
                let steps = written / PROGRESS_STEP;
                if steps > steps_reported {
                    steps_reported = steps;
                    let percent = (written as f64 / total as f64 * 100.0).min(100.0);
                    outbox
                        .text(format!(
                            "progress: {:.1}% ({}/{})",
                            percent,
                            format_size(written),
                            format_size(total)
                        ))
                        .await;
                }
            }
        }

        writer.flush().await?;
        Ok(written)
    }

    fn schedule_cleanup(&self, path: PathBuf) {
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!("cleanup of {} skipped: {}", path.display(), e);
            }
        });
    }

    /// Upload one attachment, then refresh the user's view of the target
    /// directory straight from the server.
    pub async fn upload(
        &self,
        client: &AlistClient,
        user_id: &str,
        request: &UploadRequest,
        session: &SharedSession,
        max_entries: usize,
        outbox: &Outbox,
    ) -> NavResult<()> {
        let meta = tokio::fs::metadata(&request.local_path)
            .await
            .ok()
            .filter(|m| m.is_file())
            .ok_or_else(|| {
                NavError::TransferError("could not read the attachment, send it again".to_string())
            })?;

        if meta.len() > self.max_upload_bytes {
            return Err(NavError::SizeExceeded {
                actual: meta.len(),
                limit: self.max_upload_bytes,
            });
        }

        outbox
            .text(format!(
                "uploading {}\nsize: {}\ntarget: {}",
                request.filename,
                format_size(meta.len()),
                request.target_dir
            ))
            .await;

        if !client
            .put_file(&request.local_path, &request.target_dir, &request.filename)
            .await
        {
            return Err(NavError::TransferError(
                "upload rejected, check the connection and permissions".to_string(),
            ));
        }

        tracing::info!(
            "{} uploaded {} to {}",
            user_id,
            request.filename,
            request.target_dir
        );
        outbox
            .text(format!(
                "upload complete\nfile: {}\npath: {}",
                request.filename, request.target_dir
            ))
            .await;

        let Some(listing) = client.list_directory(&request.target_dir, 1, 0).await else {
            outbox.text("could not refresh the directory listing").await;
            return Ok(());
        };

        let text = {
            let mut state = session.lock().await;
            state
                .nav
                .show(&request.target_dir, listing.content.clone(), max_entries);
            format_listing(
                state.nav.current_path(),
                &listing.content,
                state.nav.items(),
                state.nav.ancestors().len(),
                false,
            )
        };
        outbox.text(format!("directory updated\n\n{}", text)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("report (final).pdf"), "report final.pdf");
        assert_eq!(safe_name("../../etc/passwd"), "....etcpasswd");
        assert_eq!(safe_name("电影.mp4"), "电影.mp4");
        assert_eq!(safe_name(&"a".repeat(300)).len(), 100);
        assert_eq!(safe_name(".."), "file");
        assert_eq!(safe_name("/"), "file");
        assert_eq!(safe_name(""), "file");
    }

    #[test]
    fn test_from_attachment_file_keeps_name() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let req = UploadRequest::from_attachment(
            Attachment::File {
                name: "notes.txt".to_string(),
                path: PathBuf::from("/tmp/abc"),
            },
            "/docs",
            now,
        );
        assert_eq!(req.filename, "notes.txt");
        assert_eq!(req.local_path, PathBuf::from("/tmp/abc"));
        assert_eq!(req.target_dir, "/docs");
    }

    #[test]
    fn test_from_attachment_image_names() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let png = UploadRequest::from_attachment(
            Attachment::Image {
                path: PathBuf::from("/tmp/shot.PNG"),
            },
            "/pics",
            now,
        );
        assert_eq!(png.filename, "image_1700000000.PNG");

        let unknown = UploadRequest::from_attachment(
            Attachment::Image {
                path: PathBuf::from("/tmp/blob"),
            },
            "/pics",
            now,
        );
        assert_eq!(unknown.filename, "image_1700000000.jpg");
    }

    #[tokio::test]
    async fn test_upload_over_limit_never_reaches_server() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_upload_size: 1,
            data_dir: Some(dir.path().display().to_string()),
            ..Settings::default()
        };
        let orchestrator = TransferOrchestrator::new(&settings);

        let local = dir.path().join("big.bin");
        std::fs::write(&local, vec![0u8; 1024 * 1024 + 1]).unwrap();

        // Nothing listens here; reaching the network would surface as a
        // TransferError instead of SizeExceeded.
        let client = AlistClient::new("http://127.0.0.1:9", "", "", "");
        let session = crate::session::SessionRegistry::new(4).session("alice");
        let (outbox, mut rx) = Outbox::channel(8);
        let request = UploadRequest {
            local_path: local,
            target_dir: "/docs".to_string(),
            filename: "big.bin".to_string(),
        };

        let err = orchestrator
            .upload(&client, "alice", &request, &session, 20, &outbox)
            .await
            .unwrap_err();
        assert!(matches!(err, NavError::SizeExceeded { limit, .. } if limit == 1024 * 1024));
        drop(outbox);
        assert!(rx.recv().await.is_none(), "nothing was announced");
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            data_dir: Some(dir.path().display().to_string()),
            ..Settings::default()
        };
        let orchestrator = TransferOrchestrator::new(&settings);
        let client = AlistClient::new("http://127.0.0.1:9", "", "", "");
        let session = crate::session::SessionRegistry::new(4).session("alice");
        let (outbox, _rx) = Outbox::channel(8);
        let request = UploadRequest {
            local_path: dir.path().join("missing"),
            target_dir: "/".to_string(),
            filename: "missing".to_string(),
        };

        let err = orchestrator
            .upload(&client, "alice", &request, &session, 20, &outbox)
            .await
            .unwrap_err();
        assert!(matches!(err, NavError::TransferError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scratch_file_removed_after_cleanup_delay() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cleanup_delay_secs: 10,
            data_dir: Some(dir.path().display().to_string()),
            ..Settings::default()
        };
        let orchestrator = TransferOrchestrator::new(&settings);
        let scratch = orchestrator.scratch_path("alice", "report.pdf");
        std::fs::create_dir_all(orchestrator.downloads_dir()).unwrap();
        std::fs::write(&scratch, b"pdf").unwrap();

        orchestrator.schedule_cleanup(scratch.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(scratch.exists(), "still within the grace period");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_download_over_limit_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_download_size: 1,
            data_dir: Some(dir.path().display().to_string()),
            ..Settings::default()
        };
        let orchestrator = TransferOrchestrator::new(&settings);
        let client = AlistClient::new("http://127.0.0.1:9", "", "", "");
        let (outbox, _rx) = Outbox::channel(8);
        let entry = Entry {
            name: "big.iso".to_string(),
            is_dir: false,
            size: 2 * 1024 * 1024,
            modified: None,
            provider: None,
            parent: None,
        };

        let err = orchestrator
            .download(&client, "alice", "/big.iso", &entry, &outbox)
            .await
            .unwrap_err();
        assert!(matches!(err, NavError::SizeExceeded { .. }));
        assert!(!orchestrator.downloads_dir().exists());
    }
}
