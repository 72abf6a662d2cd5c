use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_CAPTURE_LIMIT: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK, HeaderMap::new())
    }

    pub fn with_content_type(status: StatusCode, content_type: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self::new(status, headers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("caller connection is gone")]
    CallerGone,
    #[error("response head was already written")]
    HeadAlreadyWritten,
}

/// The caller-facing side of an attempt. `write` sends a `200 OK` head first
/// when none was written yet.
#[async_trait]
pub trait ResponseWriter: Send {
    async fn write_head(&mut self, head: ResponseHead) -> Result<(), WriteError>;

    async fn write(&mut self, chunk: Bytes) -> Result<(), WriteError>;

    fn head_written(&self) -> bool;

    fn is_closed(&self) -> bool {
        false
    }
}

/// Receiving half of [`response_channel`], consumed by the HTTP front end.
pub struct ResponseReceiver {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Bytes>,
}

pub struct ChannelWriter {
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<Bytes>,
}

/// Bounded so a slow caller pushes back on the upstream read loop.
pub fn response_channel(buffer: usize) -> (ChannelWriter, ResponseReceiver) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
    (
        ChannelWriter {
            head_tx: Some(head_tx),
            body_tx,
        },
        ResponseReceiver {
            head: head_rx,
            body: body_rx,
        },
    )
}

#[async_trait]
impl ResponseWriter for ChannelWriter {
    async fn write_head(&mut self, head: ResponseHead) -> Result<(), WriteError> {
        let tx = self.head_tx.take().ok_or(WriteError::HeadAlreadyWritten)?;
        tx.send(head).map_err(|_| WriteError::CallerGone)
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), WriteError> {
        if self.head_tx.is_some() {
            self.write_head(ResponseHead::ok()).await?;
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.body_tx
            .send(chunk)
            .await
            .map_err(|_| WriteError::CallerGone)
    }

    fn head_written(&self) -> bool {
        self.head_tx.is_none()
    }

    fn is_closed(&self) -> bool {
        self.body_tx.is_closed()
    }
}

/// Buffers the whole response in memory. Used for channel health checks.
#[derive(Debug, Default)]
pub struct CollectWriter {
    pub head: Option<ResponseHead>,
    pub body: BytesMut,
}

impl CollectWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|head| head.status)
    }
}

#[async_trait]
impl ResponseWriter for CollectWriter {
    async fn write_head(&mut self, head: ResponseHead) -> Result<(), WriteError> {
        if self.head.is_some() {
            return Err(WriteError::HeadAlreadyWritten);
        }
        self.head = Some(head);
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), WriteError> {
        if self.head.is_none() {
            self.head = Some(ResponseHead::ok());
        }
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    fn head_written(&self) -> bool {
        self.head.is_some()
    }
}

#[derive(Debug)]
pub struct BufferPool {
    buffers: parking_lot::Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_buffers: usize,
    allocated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub pooled: usize,
    pub allocated: u64,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            buffers: parking_lot::Mutex::new(Vec::with_capacity(max_buffers)),
            buffer_size,
            max_buffers,
            allocated: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> BytesMut {
        if let Some(mut buf) = self.buffers.lock().pop() {
            buf.clear();
            return buf;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(self.buffer_size)
    }

    /// Buffers that grew past the pool size, or arrive when the pool is full,
    /// are dropped.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.buffer_size {
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push(buf);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            pooled: self.buffers.lock().len(),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }
}

/// Tee in front of the caller: chunks are forwarded untouched and a copy of
/// at most `limit` bytes is kept for the request detail.
pub struct CaptureWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    pool: Arc<BufferPool>,
    buf: Option<BytesMut>,
    limit: usize,
    status: Option<StatusCode>,
    forwarded: u64,
}

impl<'a> CaptureWriter<'a> {
    pub fn new(inner: &'a mut dyn ResponseWriter, pool: Arc<BufferPool>, limit: usize) -> Self {
        Self {
            inner,
            pool,
            buf: None,
            limit,
            status: None,
            forwarded: 0,
        }
    }

    fn capture(&mut self, chunk: &[u8]) {
        if self.limit == 0 {
            return;
        }
        let pool = &self.pool;
        let buf = self.buf.get_or_insert_with(|| pool.get());
        let remaining = self.limit.saturating_sub(buf.len());
        if remaining > 0 {
            buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
        }
    }

    pub fn captured(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    pub fn captured_text(&self) -> String {
        String::from_utf8_lossy(self.captured()).into_owned()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn forwarded_bytes(&self) -> u64 {
        self.forwarded
    }
}

impl Drop for CaptureWriter<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[async_trait]
impl<'a> ResponseWriter for CaptureWriter<'a> {
    async fn write_head(&mut self, head: ResponseHead) -> Result<(), WriteError> {
        let status = head.status;
        self.inner.write_head(head).await?;
        self.status = Some(status);
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), WriteError> {
        if self.status.is_none() && !self.inner.head_written() {
            self.status = Some(StatusCode::OK);
        }
        self.capture(&chunk);
        self.forwarded += chunk.len() as u64;
        self.inner.write(chunk).await
    }

    fn head_written(&self) -> bool {
        self.inner.head_written()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_is_bounded_while_forwarding_everything() {
        let pool = Arc::new(BufferPool::new(64, 4));
        let mut sink = CollectWriter::new();
        {
            let mut writer = CaptureWriter::new(&mut sink, pool.clone(), 10);
            for chunk in ["hello ", "streaming ", "world"] {
                writer.write(Bytes::from(chunk)).await.unwrap();
            }
            assert_eq!(writer.captured(), b"hello stre");
            assert_eq!(writer.forwarded_bytes(), 21);
            assert_eq!(writer.status(), Some(StatusCode::OK));
        }
        assert_eq!(&sink.body[..], b"hello streaming world");
        assert_eq!(sink.status(), Some(StatusCode::OK));
        assert_eq!(pool.stats().pooled, 1);
    }

    #[tokio::test]
    async fn zero_limit_captures_nothing() {
        let pool = Arc::new(BufferPool::new(64, 4));
        let mut sink = CollectWriter::new();
        let mut writer = CaptureWriter::new(&mut sink, pool.clone(), 0);
        writer.write(Bytes::from_static(b"abc")).await.unwrap();
        assert!(writer.captured().is_empty());
        drop(writer);
        assert_eq!(pool.stats().allocated, 0);
    }

    #[test]
    fn pool_drops_oversized_and_excess_buffers() {
        let pool = BufferPool::new(16, 1);
        let mut big = pool.get();
        big.reserve(1024);
        pool.put(big);
        assert_eq!(pool.stats().pooled, 0);

        pool.put(BytesMut::with_capacity(8));
        pool.put(BytesMut::with_capacity(8));
        assert_eq!(pool.stats().pooled, 1);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(pool.stats().pooled, 0);
    }

    #[tokio::test]
    async fn channel_writer_sends_implicit_head() {
        let (mut writer, mut receiver) = response_channel(4);
        assert!(!writer.head_written());
        writer.write(Bytes::from_static(b"data")).await.unwrap();
        assert!(writer.head_written());
        let head = receiver.head.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(receiver.body.recv().await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(
            writer.write_head(ResponseHead::ok()).await,
            Err(WriteError::HeadAlreadyWritten)
        );
    }

    #[tokio::test]
    async fn channel_writer_reports_gone_caller() {
        let (mut writer, receiver) = response_channel(1);
        drop(receiver);
        assert!(writer.is_closed());
        assert_eq!(
            writer.write(Bytes::from_static(b"x")).await,
            Err(WriteError::CallerGone)
        );
    }
}
