//! Outgoing text and files.
//!
//! A file goes out as `file-start`, then binary fragments, then `file-end`.
//! Before each fragment the sender checks the channel's send buffer and, if
//! it is above the low-water mark, suspends until the transport's
//! buffered-amount-low notification fires. `file-end` is only sent once the
//! buffer has drained to zero, so the receiver has every byte before it
//! finalizes.

use std::path::Path;
use std::sync::Arc;

use bytes::BytesMut;
use peerdrop_proto::frame::{self, Frame};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::channel::DataChannel;

use super::{TransferError, TransferEvent, TransferPolicy, progress_fraction};

/// Sends frames and files over one data channel.
///
/// Clones share the channel and the outgoing-transfer slot: at most one file
/// is in flight per channel, text can be sent at any time.
pub struct FileSender<C: DataChannel> {
    channel: Arc<C>,
    policy: TransferPolicy,
    slot: Arc<Mutex<()>>,
}

impl<C: DataChannel> Clone for FileSender<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            policy: self.policy.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C: DataChannel> std::fmt::Debug for FileSender<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSender")
            .field("policy", &self.policy)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl<C: DataChannel> FileSender<C> {
    /// Creates a sender for an open channel.
    pub fn new(channel: Arc<C>, policy: TransferPolicy) -> Self {
        Self {
            channel,
            policy,
            slot: Arc::new(Mutex::new(())),
        }
    }

    /// The pacing policy in use.
    #[must_use]
    pub const fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    /// Whether a file send currently holds the slot.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Send a `text` frame.
    ///
    /// # Errors
    ///
    /// [`TransferError::NotOpen`] if the channel is not open, or the
    /// channel's send error.
    pub async fn send_text(&self, message: &str) -> Result<(), TransferError> {
        if !self.channel.is_open() {
            return Err(TransferError::NotOpen);
        }
        let text = frame::encode(&Frame::text(message))?;
        self.channel.send_text(&text).await?;
        tracing::debug!(len = message.len(), "sent text frame");
        Ok(())
    }

    /// Send the file at `path`, announcing it under its final path component.
    ///
    /// Returns the number of bytes sent. Progress is reported on `events`,
    /// followed by exactly one [`TransferEvent::SendComplete`] or
    /// [`TransferEvent::SendFailed`].
    ///
    /// # Errors
    ///
    /// - [`TransferError::InvalidFileName`] for a path without a UTF-8 file name.
    /// - [`TransferError::Io`] if the file cannot be opened or read.
    /// - Everything [`send_reader`](Self::send_reader) returns.
    pub async fn send_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<u64, TransferError> {
        let name = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
        let result = match &name {
            Some(name) => self.send_path(name, path, cancel, events).await,
            None => Err(TransferError::InvalidFileName(path.display().to_string())),
        };
        report(name.as_deref(), result, events)
    }

    /// Send `size` bytes read from `reader` as a file called `name`.
    ///
    /// Events are reported as for [`send_file`](Self::send_file).
    ///
    /// # Errors
    ///
    /// - [`TransferError::Busy`] if another file is in flight on this channel.
    /// - [`TransferError::NotOpen`] if the channel is not open.
    /// - [`TransferError::Cancelled`] if `cancel` fires; no fragment is sent
    ///   after that point.
    /// - [`TransferError::DrainTimeout`] if the buffer does not empty before
    ///   `file-end` within the policy's drain timeout.
    /// - [`TransferError::Io`] if the reader fails or ends early.
    /// - [`TransferError::Channel`] if the channel rejects a message.
    pub async fn send_reader<R>(
        &self,
        name: &str,
        size: u64,
        reader: R,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result = self.send_exclusive(name, size, reader, cancel, events).await;
        report(Some(name), result, events)
    }

    async fn send_path(
        &self,
        name: &str,
        path: &Path,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<u64, TransferError> {
        if !self.channel.is_open() {
            return Err(TransferError::NotOpen);
        }
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        self.send_exclusive(name, metadata.len(), file, cancel, events)
            .await
    }

    async fn send_exclusive<R>(
        &self,
        name: &str,
        size: u64,
        reader: R,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let _slot = Arc::clone(&self.slot)
            .try_lock_owned()
            .map_err(|_| TransferError::Busy)?;
        if !self.channel.is_open() {
            return Err(TransferError::NotOpen);
        }
        self.transmit(name, size, reader, cancel, events).await
    }

    async fn transmit<R>(
        &self,
        name: &str,
        size: u64,
        mut reader: R,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        // Step 1: announce
        let start = frame::encode(&Frame::file_start(name, size))?;
        self.channel.send_text(&start).await?;
        let _ = events.send(TransferEvent::SendStarted {
            name: name.to_string(),
            size,
        });

        // Step 2: fragment size (whole file when it fits in one message)
        let fragment_len = self.fragment_len(size);
        tracing::debug!(file = name, size, fragment_len, "sending file");

        // Step 3: paced fragments
        let mut sent: u64 = 0;
        while sent < size {
            self.wait_for_low_water(cancel).await?;

            let len = usize::try_from((size - sent).min(fragment_len as u64))
                .unwrap_or(fragment_len);
            let mut buf = BytesMut::zeroed(len);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransferError::Cancelled),
                res = reader.read_exact(&mut buf) => {
                    res?;
                }
            }
            // The token may fire while the read is completing.
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            self.channel.send_binary(buf.freeze()).await?;

            sent += len as u64;
            let _ = events.send(TransferEvent::SendProgress {
                name: name.to_string(),
                sent,
                size,
                fraction: progress_fraction(sent, size),
            });
        }

        // Step 4: drain to zero, then close the file
        self.drain(cancel).await?;
        let end = frame::encode(&Frame::FileEnd)?;
        self.channel.send_text(&end).await?;
        Ok(sent)
    }

    fn fragment_len(&self, size: u64) -> usize {
        let max = self.channel.max_message_size().max(1);
        let fits = usize::try_from(size).is_ok_and(|s| s <= max);
        if size < self.policy.single_message_threshold && fits {
            usize::try_from(size).unwrap_or(max).max(1)
        } else {
            self.policy.chunk_size.clamp(1, max)
        }
    }

    async fn wait_for_low_water(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let low_water = self.policy.low_water_mark;
        if self.channel.buffered_amount().await > low_water {
            tracing::trace!(low_water, "send buffer above low-water mark, pausing");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransferError::Cancelled),
                res = self.channel.wait_buffered_amount_at_most(low_water) => res?,
            }
            // Cancellation may race the wake-up.
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
        }
        Ok(())
    }

    async fn drain(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        let timeout = self.policy.drain_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransferError::Cancelled),
            res = tokio::time::timeout(timeout, self.channel.wait_buffered_amount_at_most(0)) => {
                match res {
                    Ok(inner) => inner.map_err(TransferError::from),
                    Err(_) => Err(TransferError::DrainTimeout(timeout)),
                }
            }
        }
    }
}

fn report(
    name: Option<&str>,
    result: Result<u64, TransferError>,
    events: &mpsc::UnboundedSender<TransferEvent>,
) -> Result<u64, TransferError> {
    match &result {
        Ok(size) => {
            tracing::info!(file = ?name, size, "file sent");
            let _ = events.send(TransferEvent::SendComplete {
                name: name.unwrap_or_default().to_string(),
                size: *size,
            });
        }
        Err(e) => {
            tracing::warn!(file = ?name, error = %e, "file send failed");
            let _ = events.send(TransferEvent::SendFailed {
                name: name.map(str::to_string),
                reason: e.to_string(),
            });
        }
    }
    result
}
