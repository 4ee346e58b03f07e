//! 定义库中使用的错误类型。
//!
//! 本模块包含两种主要的错误枚举：
//! - `DistributorError`: 表示在 `FrameDistributor` actor 内部处理请求时可能发生的拓扑/协议错误。
//!   这些错误通常通过请求的回调通道 (`oneshot::Sender`) 返回给调用者。
//! - `FeedError`: 这是暴露给库用户的顶层错误类型。
//!   它封装了与分发器通信时可能发生的错误（如通道发送/接收失败）、
//!   从分发器收到的 `DistributorError`，以及帧转发过程中的数据错误和 I/O 错误。

use crate::types::{DistributionMode, Request, WriterId};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// `FrameDistributor` 内部处理逻辑中可能产生的具体错误。
///
/// 拓扑操作错误（重复注册、注销未知写入端、在 INACTIVE 模式下注销）属于调用方的协议错误：
/// 它们让当前操作失败，但不会影响分发器本身的后续运行。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributorError {
    /// 表示一个未预期的内部错误或不一致状态。
    #[error("内部逻辑错误: {0}")]
    Internal(String),

    /// 尝试注册一个已经注册过的写入端。
    #[error("写入端 {0} 已经注册，不能重复注册")]
    AlreadyRegistered(WriterId),

    /// 尝试注销一个从未注册（或已经注销）的写入端。
    #[error("写入端 {0} 未注册，无法注销")]
    NotRegistered(WriterId),

    /// 在不允许注销的分发模式下（即 INACTIVE）尝试注销帧收集器。
    #[error("在 {0} 模式下无法注销帧收集器")]
    InvalidDeregistration(DistributionMode),

    /// 注册时打开下游写入端失败。
    #[error("打开写入端 {writer_id} 失败: {message}")]
    WriterOpenFailed {
        /// 相关的写入端 ID。
        writer_id: WriterId,
        /// 写入端返回的错误描述。
        message: String,
    },

    /// 推送的帧长度与配置的帧大小不一致。
    #[error("帧长度 {actual} 与配置的帧大小 {expected} 不一致")]
    InvalidFrameSize {
        /// 配置的帧大小。
        expected: usize,
        /// 实际收到的帧长度。
        actual: usize,
    },

    /// 溢出日志 (spill log) 的写入或回放失败。
    /// 磁盘被视为可靠存储，因此这类错误不会在内部重试。
    #[error("溢出日志 I/O 失败: {0}")]
    SpillIo(String),

    /// 分发器已经执行过 `close`，不再接受新的请求。
    #[error("分发器已关闭，不再接受请求")]
    Closed,
}

/// 用户与 `DistributorHandle`、帧收集器或协调器交互时可能遇到的顶层错误类型。
#[derive(Error, Debug)]
pub enum FeedError {
    /// 向分发器 actor 发送请求失败，通常说明 actor 任务已经退出。
    #[error("向分发器发送请求失败 (分发器可能已停止): {0}")]
    SendRequestError(#[from] mpsc::error::SendError<Request>),

    /// 等待分发器回复时失败（回复通道在回复前被关闭）。
    #[error("从分发器接收回复失败 (分发器可能已停止): {0}")]
    ReceiveReplyError(#[from] oneshot::error::RecvError),

    /// 分发器成功接收请求，但报告了拓扑或协议错误。
    #[error("分发器报告处理错误: {0}")]
    Distributor(#[from] DistributorError),

    /// 下游处理某个元组时发生的数据级错误。
    /// `tuple_index` 指向帧内导致错误的元组，异常处理器据此切掉该元组及其之前的所有元组。
    #[error("帧内第 {tuple_index} 个元组处理失败: {message}")]
    FrameData {
        /// 导致错误的元组在帧内的下标。
        tuple_index: usize,
        /// 错误描述。
        message: String,
    },

    /// 帧的元组偏移索引不合法。
    #[error("帧格式错误: {0}")]
    MalformedFrame(String),

    /// 下游写入端报告的非数据级错误。
    #[error("写入端错误: {0}")]
    Writer(String),

    /// 本地磁盘 I/O 失败（溢出日志的写入/回放）。
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 负载/扩缩容协调过程中外部作业控制器报告的失败。
    #[error("扩缩容协调失败: {0}")]
    Coordinator(String),
}

impl FeedError {
    /// 是否为可以通过切片跳过的元组级数据错误。
    pub fn is_frame_data_error(&self) -> bool {
        matches!(self, FeedError::FrameData { .. })
    }
}
