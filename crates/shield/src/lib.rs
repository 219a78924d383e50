//! # SmartShield
//!
//! 自适应的按客户端准入控制层：度量每个请求的开销，按 (分组, 客户端) 维护
//! 随时间衰减的用量，并在写出响应时实时决定放行、限速或拒绝。
//!
//! ## 组成
//!
//! - [`ShieldPolicy`]：每个分组的阈值、窗口与 bypass 配置
//! - [`UsageLedger`]：单个分组的用量账本
//! - [`ShieldRegistry`]：所有分组账本的并发安全注册表，负责过期回收
//! - [`engine`]：纯函数的决策与计费逻辑
//! - [`GuardedResponseWriter`]：装饰任意 [`ResponseSink`] 的响应写入器
//!
//! 本 crate 不依赖任何 HTTP 框架，只通过 [`ResponseSink`] 能力接口与代理层对接。

pub mod engine;
pub mod error;
pub mod ledger;
pub mod policy;
pub mod registry;
pub mod sink;
pub mod writer;

pub use engine::{Decision, cost_of, decide};
pub use error::{Result, ShieldError};
pub use ledger::{LedgerStats, UsageLedger};
pub use policy::ShieldPolicy;
pub use registry::{DEFAULT_RETENTION, GroupSnapshot, ShieldRegistry};
pub use sink::{Flush, Hijack, ResponseSink};
pub use writer::{
    GuardedResponseWriter, REJECTION_BODY, RequestAccounting, ResponseOutcome, ShieldBinding,
    WriterState,
};
