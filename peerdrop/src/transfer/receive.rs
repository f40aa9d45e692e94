//! Incoming frame dispatch and file reassembly.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use peerdrop_proto::frame::{self, Frame};
use tokio::io::AsyncWriteExt;

use crate::channel::ChannelMessage;

use super::{ReceivedFile, TransferEvent, progress_fraction, sanitize_file_name};

/// A file announced by `file-start` and not yet finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingTransfer {
    /// Announced name.
    pub name: String,
    /// Announced size.
    pub size: u64,
    /// Bytes received so far.
    pub received: u64,
    fragments: Vec<Bytes>,
}

impl IncomingTransfer {
    fn new(name: String, size: u64) -> Self {
        Self {
            name,
            size,
            received: 0,
            fragments: Vec::new(),
        }
    }

    fn finish(self) -> ReceivedFile {
        let mut data = BytesMut::with_capacity(usize::try_from(self.received).unwrap_or(0));
        for fragment in &self.fragments {
            data.extend_from_slice(fragment);
        }
        ReceivedFile {
            truncated: self.received != self.size,
            name: self.name,
            declared_size: self.size,
            data: data.freeze(),
        }
    }
}

/// Receive-side state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReceiveState {
    /// No file in progress.
    #[default]
    Idle,
    /// Fragments are being collected.
    Receiving(IncomingTransfer),
}

/// Turns channel messages into [`TransferEvent`]s.
///
/// Every message is handled in every state; protocol violations (malformed
/// frames, orphan fragments, stray `file-end`) are logged and dropped.
#[derive(Debug, Default)]
pub struct Reassembler {
    state: ReceiveState,
}

impl Reassembler {
    /// Creates an idle reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current receive state.
    #[must_use]
    pub const fn state(&self) -> &ReceiveState {
        &self.state
    }

    /// Handle one message from the data channel.
    pub fn on_message(&mut self, message: ChannelMessage) -> Vec<TransferEvent> {
        match message {
            ChannelMessage::Text(text) => match frame::decode(&text) {
                Ok(frame) => self.on_frame(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed frame dropped");
                    Vec::new()
                }
            },
            ChannelMessage::Binary(data) => self.on_fragment(data),
        }
    }

    /// Drop any partially received file.
    pub fn reset(&mut self) -> Option<TransferEvent> {
        match std::mem::take(&mut self.state) {
            ReceiveState::Idle => None,
            ReceiveState::Receiving(transfer) => {
                tracing::info!(
                    file = %transfer.name,
                    received = transfer.received,
                    "discarding partial file"
                );
                Some(TransferEvent::ReceiveDiscarded {
                    name: transfer.name,
                    received: transfer.received,
                })
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Vec<TransferEvent> {
        match frame {
            Frame::Text { message } => vec![TransferEvent::TextReceived { message }],
            Frame::FileStart { name, size } => {
                let mut events = Vec::with_capacity(2);
                if let Some(discarded) = self.reset() {
                    tracing::warn!("file-start before file-end, previous file replaced");
                    events.push(discarded);
                }
                tracing::info!(file = %name, size, "receiving file");
                events.push(TransferEvent::ReceiveStarted {
                    name: name.clone(),
                    size,
                });
                self.state = ReceiveState::Receiving(IncomingTransfer::new(name, size));
                events
            }
            Frame::FileEnd => match std::mem::take(&mut self.state) {
                ReceiveState::Idle => {
                    tracing::warn!("file-end with no file in progress, dropped");
                    Vec::new()
                }
                ReceiveState::Receiving(transfer) => {
                    let file = transfer.finish();
                    if file.truncated {
                        tracing::warn!(
                            file = %file.name,
                            declared = file.declared_size,
                            received = file.data.len(),
                            "file size mismatch, keeping what arrived"
                        );
                    } else {
                        tracing::info!(file = %file.name, size = file.declared_size, "file received");
                    }
                    vec![TransferEvent::ReceiveComplete(file)]
                }
            },
        }
    }

    fn on_fragment(&mut self, data: Bytes) -> Vec<TransferEvent> {
        let ReceiveState::Receiving(transfer) = &mut self.state else {
            tracing::warn!(len = data.len(), "binary fragment with no file in progress, dropped");
            return Vec::new();
        };
        transfer.received += data.len() as u64;
        transfer.fragments.push(data);
        vec![TransferEvent::ReceiveProgress {
            name: transfer.name.clone(),
            received: transfer.received,
            size: transfer.size,
            fraction: progress_fraction(transfer.received, transfer.size),
        }]
    }
}

/// Write a received file into `dir` without overwriting anything.
///
/// The peer's name is sanitized; if it is taken, ` (1)`, ` (2)`, ... is
/// inserted before the extension. Returns the path written.
///
/// # Errors
///
/// Returns the I/O error if the directory cannot be created or the file
/// cannot be written.
pub async fn save_received_file(dir: &Path, file: &ReceivedFile) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = sanitize_file_name(&file.name);
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.clone(), String::new()),
    };

    for attempt in 0..1000u32 {
        let candidate = if attempt == 0 {
            dir.join(&name)
        } else {
            dir.join(format!("{stem} ({attempt}){ext}"))
        };
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(mut out) => {
                out.write_all(&file.data).await?;
                out.flush().await?;
                tracing::info!(path = %candidate.display(), size = file.data.len(), "saved file");
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free file name for {name} in {}", dir.display()),
    ))
}
