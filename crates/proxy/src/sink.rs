//! ChannelSink：把 shield 写入器的调用转换为 axum 流式响应
//!
//! 状态行与响应头是惰性提交的：`write_header` 只记录，直到第一次
//! write / flush / hijack 才通过 oneshot 把响应头交给 handler。
//! 提交前再次调用 `write_header` 会覆盖状态码（拒绝路径依赖这一点用 503
//! 替换尚未发出的状态），提交后的调用被忽略。

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use http::{HeaderMap, StatusCode};
use hyper::upgrade::OnUpgrade;
use shield::{Flush, Hijack, ResponseSink};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// 每个响应在内存中缓冲的最大分块数
pub const BODY_BUFFER: usize = 16;

type Chunk = Result<Bytes, io::Error>;

/// 已提交的响应头
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// 写入端，由转发任务持有（经 `GuardedResponseWriter` 包装）
pub struct ChannelSink {
    status: StatusCode,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<Chunk>,
    on_upgrade: Option<OnUpgrade>,
    disconnected: CancellationToken,
}

/// 接收端，由 axum handler 持有
pub struct SinkReceiver {
    head_rx: oneshot::Receiver<ResponseHead>,
    body_rx: mpsc::Receiver<Chunk>,
    guard: DropGuard,
}

impl ChannelSink {
    pub fn channel(buffer: usize) -> (Self, SinkReceiver) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
        let disconnected = CancellationToken::new();

        let sink = Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx,
            on_upgrade: None,
            disconnected: disconnected.clone(),
        };
        let receiver = SinkReceiver {
            head_rx,
            body_rx,
            guard: disconnected.drop_guard(),
        };
        (sink, receiver)
    }

    /// 挂上下游连接的升级句柄，使 hijack 能力可用
    pub fn with_upgrade(mut self, on_upgrade: Option<OnUpgrade>) -> Self {
        self.on_upgrade = on_upgrade;
        self
    }

    /// 响应体被丢弃（客户端断开或响应结束）时触发
    pub fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    pub fn is_committed(&self) -> bool {
        self.head_tx.is_none()
    }

    fn commit(&mut self) -> io::Result<()> {
        let Some(head_tx) = self.head_tx.take() else {
            return Ok(());
        };
        let head = ResponseHead {
            status: self.status,
            headers: std::mem::take(&mut self.headers),
        };
        head_tx
            .send(head)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

impl Flush for ChannelSink {
    fn flush(&mut self) -> io::Result<()> {
        self.commit()
    }
}

impl Hijack for ChannelSink {
    type Conn = OnUpgrade;

    fn hijack(&mut self) -> io::Result<OnUpgrade> {
        let on_upgrade = self.on_upgrade.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "connection is not upgradable")
        })?;
        self.commit()?;
        Ok(on_upgrade)
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    type Conn = OnUpgrade;

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        if self.is_committed() {
            debug!(status = status.as_u16(), "response head already committed");
            return;
        }
        self.status = status;
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.commit()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.body_tx
            .send(Ok(Bytes::copy_from_slice(buf)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))?;
        Ok(buf.len())
    }

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        Some(self)
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack<Conn = OnUpgrade>> {
        if self.on_upgrade.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl SinkReceiver {
    /// 等待响应头提交并组装 axum 响应
    ///
    /// 写入端在提交前被丢弃时返回 `None`。
    pub async fn into_response(self) -> Option<Response> {
        let Self {
            head_rx,
            body_rx,
            guard,
        } = self;
        let head = head_rx.await.ok()?;

        let body = if head.status == StatusCode::SWITCHING_PROTOCOLS {
            drop(guard);
            Body::empty()
        } else {
            Body::from_stream(GuardedStream {
                inner: ReceiverStream::new(body_rx),
                _guard: guard,
            })
        };

        let mut response = Response::new(body);
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        Some(response)
    }
}

/// 响应体流；被丢弃时取消对应的请求
struct GuardedStream {
    inner: ReceiverStream<Chunk>,
    _guard: DropGuard,
}

impl Stream for GuardedStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
