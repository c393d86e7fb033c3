//! Optional transformation of outgoing file data, such as encryption keyed
//! from an encrypted conversation with the receiver.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Transforms the bytes of a file before they are framed for the wire.
///
/// `wrap` sees the file in order, one read at a time. `before_finish` runs
/// once after the last read and may return trailing bytes, for example a
/// MAC over everything sent.
pub trait SendWrapper: Send {
    fn wrap(&mut self, chunk: &[u8]) -> Vec<u8>;

    fn before_finish(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Sends the file as it is on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl SendWrapper for PassThrough {
    fn wrap(&mut self, chunk: &[u8]) -> Vec<u8> {
        chunk.to_vec()
    }
}

/// Reads a source through a [`SendWrapper`] and hands out the result in
/// blocks of a requested size.
pub(crate) struct WrappedReader<R> {
    src: R,
    wrapper: Box<dyn SendWrapper>,
    buf: Vec<u8>,
    /// Wrapped bytes not handed out yet.
    pending: Vec<u8>,
    /// Source bytes read so far.
    consumed: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> WrappedReader<R> {
    pub(crate) fn new(src: R, wrapper: Box<dyn SendWrapper>, read_size: usize) -> Self {
        Self {
            src,
            wrapper,
            buf: vec![0u8; read_size.max(1)],
            pending: Vec::new(),
            consumed: 0,
            finished: false,
        }
    }

    /// Up to `size` wrapped bytes. Only the last block is short, and `None`
    /// follows it.
    pub(crate) async fn next_block(&mut self, size: usize) -> io::Result<Option<Vec<u8>>> {
        let size = size.max(1);
        while self.pending.len() < size && !self.finished {
            let n = self.src.read(&mut self.buf).await?;
            if n == 0 {
                let trailer = self.wrapper.before_finish();
                self.pending.extend_from_slice(&trailer);
                self.finished = true;
            } else {
                self.consumed += n as u64;
                let wrapped = self.wrapper.wrap(&self.buf[..n]);
                self.pending.extend_from_slice(&wrapped);
            }
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = size.min(self.pending.len());
        Ok(Some(self.pending.drain(..take).collect()))
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Everything, trailer included, has been handed out.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.finished && self.pending.is_empty()
    }
}
