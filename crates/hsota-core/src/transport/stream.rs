//! Channel-fed byte stream shared by the HTTP and mock transports.

use std::mem;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use super::traits::{ByteStream, DownloadError};

/// One message from the producer side of a [`ChannelStream`].
pub type StreamChunk = Result<Vec<u8>, DownloadError>;

/// Byte stream whose chunks are produced on the other end of a channel.
///
/// The producer ends the stream by dropping its sender. A producer error is
/// surfaced once and ends the stream. Drained chunk buffers can be handed
/// back to the producer through a recycle channel.
pub struct ChannelStream {
    receiver: Receiver<StreamChunk>,
    recycle: Option<Sender<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    content_length: Option<u64>,
    closed: bool,
    failed: bool,
}

impl ChannelStream {
    pub fn new(receiver: Receiver<StreamChunk>, content_length: Option<u64>) -> Self {
        Self {
            receiver,
            recycle: None,
            pending: Vec::new(),
            offset: 0,
            content_length,
            closed: false,
            failed: false,
        }
    }

    /// Return every drained buffer on `recycle`.
    pub fn with_recycler(mut self, recycle: Sender<Vec<u8>>) -> Self {
        self.recycle = Some(recycle);
        self
    }

    fn remaining(&self) -> usize {
        self.pending.len() - self.offset
    }
}

impl ByteStream for ChannelStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn available(&mut self) -> Result<usize, DownloadError> {
        if self.remaining() > 0 {
            return Ok(self.remaining());
        }
        if self.closed {
            return Ok(0);
        }

        match self.receiver.try_recv() {
            Ok(Ok(chunk)) => {
                let spent = mem::replace(&mut self.pending, chunk);
                self.offset = 0;
                if let Some(recycle) = &self.recycle {
                    if spent.capacity() > 0 {
                        let _ = recycle.send(spent);
                    }
                }
                Ok(self.remaining())
            }
            Ok(Err(e)) => {
                self.closed = true;
                self.failed = true;
                Err(e)
            }
            Err(TryRecvError::Empty) => Ok(0),
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Ok(0)
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError> {
        if self.remaining() == 0 && self.available()? == 0 {
            return Ok(0);
        }

        let n = self.remaining().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn is_finished(&self) -> bool {
        self.closed && !self.failed && self.remaining() == 0
    }
}
