//! 响应写入器能力
//!
//! 核心能力 `ResponseSink`（写状态行 / 头 / 正文）之外，`Flush` 与 `Hijack`
//! 是可选能力：实现方通过 `flusher()` / `hijacker()` 在运行时声明是否支持，
//! 装饰器从不假设它们存在。

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use std::io;

/// 可选能力：立即把已缓冲的内容推给客户端
pub trait Flush: Send {
    fn flush(&mut self) -> io::Result<()>;
}

/// 可选能力：接管底层连接（协议升级，如 WebSocket）
pub trait Hijack: Send {
    type Conn;

    fn hijack(&mut self) -> io::Result<Self::Conn>;
}

/// 响应写入器核心能力
#[async_trait]
pub trait ResponseSink: Send {
    /// 接管连接后得到的原始连接类型；不支持接管的实现可使用 `()`
    type Conn: Send;

    /// 尚未提交的响应头
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// 设置状态码；状态行提交后的重复调用由实现方忽略
    fn write_header(&mut self, status: StatusCode);

    /// 写入正文，返回写入的字节数
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flusher(&mut self) -> Option<&mut dyn Flush> {
        None
    }

    fn hijacker(&mut self) -> Option<&mut dyn Hijack<Conn = Self::Conn>> {
        None
    }
}
