//! File reader source and file writer destination
//!
//! The reference connector pair. The reader polls a directory, hands each
//! file to the pipeline and then moves (or deletes) it; the writer renders
//! the encoded payload into a target directory with a filename template.

use super::{DestinationConnector, SourceConnector, SourceContext};
use crate::engine::ChannelSignal;
use crate::error::{EngineError, Result};
use crate::model::{ConnectorMessage, FileReaderSettings, FileWriterSettings, RawMessage, Response};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Poll-driven directory reader
pub struct FileReaderSource {
    settings: FileReaderSettings,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FileReaderSource {
    pub fn new(settings: FileReaderSettings) -> Self {
        Self {
            settings,
            task: Mutex::new(None),
        }
    }

    async fn scan(settings: &FileReaderSettings) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&settings.input_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if !settings.suffix.is_empty() {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !name.ends_with(&settings.suffix) {
                    continue;
                }
            }
            files.push(path);
        }
        // deterministic pick-up order
        files.sort();
        Ok(files)
    }

    async fn consume(
        settings: &FileReaderSettings,
        ctx: &SourceContext,
        path: &Path,
    ) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let raw = RawMessage::new(content)
            .with_source_entry("originalFilename", json!(file_name))
            .with_source_entry("fileDirectory", json!(settings.input_dir.clone()));

        ctx.receiver.receive(raw).await?;

        match &settings.move_to_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let target = Path::new(dir).join(&file_name);
                tokio::fs::rename(path, &target).await?;
                debug!(file = %file_name, "moved consumed file");
            }
            None => {
                tokio::fs::remove_file(path).await?;
                debug!(file = %file_name, "removed consumed file");
            }
        }
        Ok(())
    }

    async fn quarantine(settings: &FileReaderSettings, path: &Path) {
        let Some(dir) = &settings.error_dir else {
            return;
        };
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("unknown");
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(error = %e, "cannot create error directory");
            return;
        }
        let target = Path::new(dir).join(file_name);
        if let Err(e) = tokio::fs::rename(path, &target).await {
            warn!(file = %file_name, error = %e, "cannot quarantine file");
        }
    }
}

#[async_trait]
impl SourceConnector for FileReaderSource {
    fn name(&self) -> &str {
        "File Reader"
    }

    fn is_polling(&self) -> bool {
        true
    }

    async fn start(&self, mut ctx: SourceContext) -> Result<()> {
        let settings = self.settings.clone();
        if settings.input_dir.is_empty() {
            return Err(EngineError::Configuration(
                "file reader requires an input directory".to_string(),
            ));
        }

        let handle = tokio::spawn(async move {
            info!(channel = %ctx.channel_name, dir = %settings.input_dir, "file reader started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(settings.poll_interval) => {}
                    changed = ctx.signal.changed() => {
                        if changed.is_err() || *ctx.signal.borrow() != ChannelSignal::Run {
                            break;
                        }
                    }
                }
                if *ctx.signal.borrow() != ChannelSignal::Run {
                    break;
                }
                // lease validity is re-checked on every cycle; losing it
                // silences this node without stopping the task
                if let Some(lease) = &ctx.lease {
                    if !lease.is_held() {
                        continue;
                    }
                }

                let files = match Self::scan(&settings).await {
                    Ok(files) => files,
                    Err(e) => {
                        warn!(channel = %ctx.channel_name, error = %e, "input directory scan failed");
                        continue;
                    }
                };
                for path in files {
                    if *ctx.signal.borrow() != ChannelSignal::Run {
                        break;
                    }
                    if let Err(e) = Self::consume(&settings, &ctx, &path).await {
                        error!(
                            channel = %ctx.channel_name,
                            file = %path.display(),
                            error = %e,
                            "file hand-off failed"
                        );
                        Self::quarantine(&settings, &path).await;
                    }
                }
            }
            info!(channel = %ctx.channel_name, "file reader stopped");
        });

        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            // the task exits on the next signal check
            let _ = handle.await;
        }
        Ok(())
    }
}

/// File writer destination
pub struct FileWriterDestination {
    name: String,
    settings: FileWriterSettings,
}

impl FileWriterDestination {
    pub fn new(name: impl Into<String>, settings: FileWriterSettings) -> Self {
        Self {
            name: name.into(),
            settings,
        }
    }

    fn render_file_name(&self, cm: &ConnectorMessage) -> String {
        self.settings
            .file_name
            .replace("${message_id}", &cm.message_id.to_string())
    }
}

#[async_trait]
impl DestinationConnector for FileWriterDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, cm: &ConnectorMessage, payload: &str) -> Result<Response> {
        let file_name = self.render_file_name(cm);
        let dir = Path::new(&self.settings.output_dir);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| EngineError::Transport(format!("cannot create output dir: {}", e)))?;
        let target = dir.join(&file_name);

        let result = if self.settings.append {
            use tokio::io::AsyncWriteExt;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await;
            match file {
                Ok(mut file) => file.write_all(payload.as_bytes()).await,
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::write(&target, payload.as_bytes()).await
        };

        result.map_err(|e| {
            EngineError::Transport(format!("write to {} failed: {}", target.display(), e))
        })?;
        debug!(file = %target.display(), "payload written");
        Ok(Response::sent(format!("wrote {}", file_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;

    #[tokio::test]
    async fn writer_substitutes_message_id_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriterDestination::new(
            "out",
            FileWriterSettings {
                output_dir: dir.path().to_str().unwrap().to_string(),
                file_name: "${message_id}.txt".to_string(),
                append: false,
            },
        );
        let cm = ConnectorMessage::new(42, 1, "c", "out", "s1", Status::Transformed);
        let response = writer.dispatch(&cm, "body").await.unwrap();
        assert_eq!(response.status, Status::Sent);
        let written = std::fs::read_to_string(dir.path().join("42.txt")).unwrap();
        assert_eq!(written, "body");
    }

    #[tokio::test]
    async fn writer_append_mode_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriterDestination::new(
            "out",
            FileWriterSettings {
                output_dir: dir.path().to_str().unwrap().to_string(),
                file_name: "log.txt".to_string(),
                append: true,
            },
        );
        let cm = ConnectorMessage::new(1, 1, "c", "out", "s1", Status::Transformed);
        writer.dispatch(&cm, "a").await.unwrap();
        writer.dispatch(&cm, "b").await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert_eq!(written, "ab");
    }
}
