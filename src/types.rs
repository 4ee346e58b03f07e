//! 定义库的核心数据结构和类型别名。
//!
//! 这个模块包含了在 `FrameDistributor`、`DistributorHandle`、帧收集器和监控组件之间
//! 传递信息以及维护内部状态所需的基础类型定义。

pub(crate) use crate::error::DistributorError;
use crate::collector::FrameCollector;
use bytes::Bytes;
use std::fmt;
use tokio::sync::oneshot;

// --- 基本类型别名 (Basic Type Aliases) ---

/// 下游写入端的唯一标识符。
/// 分发器以它为键维护已注册的帧收集器 (writer → collector)。
pub type WriterId = String;

/// 指标上报者 (report sender) 的唯一标识符，由 `MetricCollector` 分配。
pub type SenderId = u64;

// --- 标识类型 (Identifiers) ---

/// 一个 feed 的唯一标识：所属 dataverse 与 feed 名称。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId {
    pub dataverse: String,
    pub feed_name: String,
}

impl FeedId {
    pub fn new(dataverse: impl Into<String>, feed_name: impl Into<String>) -> Self {
        Self {
            dataverse: dataverse.into(),
            feed_name: feed_name.into(),
        }
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataverse, self.feed_name)
    }
}

/// feed 与目标数据集之间的一条连接。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedConnectionId {
    pub feed_id: FeedId,
    pub dataset: String,
}

impl FeedConnectionId {
    pub fn new(feed_id: FeedId, dataset: impl Into<String>) -> Self {
        Self {
            feed_id,
            dataset: dataset.into(),
        }
    }
}

impl fmt::Display for FeedConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-->{}", self.feed_id, self.dataset)
    }
}

/// 流水线中的运行时阶段 (intake → compute → store)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedRuntimeType {
    Intake,
    Collect,
    Compute,
    Store,
    Other,
}

impl fmt::Display for FeedRuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedRuntimeType::Intake => "INTAKE",
            FeedRuntimeType::Collect => "COLLECT",
            FeedRuntimeType::Compute => "COMPUTE",
            FeedRuntimeType::Store => "STORE",
            FeedRuntimeType::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// 某条连接上某个阶段的第 `partition` 个运行时实例。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedRuntimeId {
    pub runtime_type: FeedRuntimeType,
    pub connection_id: FeedConnectionId,
    pub partition: usize,
}

impl FeedRuntimeId {
    pub fn new(
        runtime_type: FeedRuntimeType,
        connection_id: FeedConnectionId,
        partition: usize,
    ) -> Self {
        Self {
            runtime_type,
            connection_id,
            partition,
        }
    }
}

impl fmt::Display for FeedRuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] {}",
            self.connection_id, self.partition, self.runtime_type
        )
    }
}

/// 分发器的身份：每个 (feed, 运行时类型, 分区) 至多一个分发器。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedRuntimeKey {
    pub feed_id: FeedId,
    pub runtime_type: FeedRuntimeType,
    pub partition: usize,
}

impl FeedRuntimeKey {
    pub fn new(feed_id: FeedId, runtime_type: FeedRuntimeType, partition: usize) -> Self {
        Self {
            feed_id,
            runtime_type,
            partition,
        }
    }
}

impl fmt::Display for FeedRuntimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})[{}]", self.feed_id, self.runtime_type, self.partition)
    }
}

// --- 状态枚举 (State Enums) ---

/// 分发器的拓扑状态，必须与已注册收集器的数量保持一致：
/// `Inactive` ⇔ 0 个，`Single` ⇔ 1 个，`Shared` ⇔ 至少 2 个。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionMode {
    /// 没有收集器，所有到达的帧被直接丢弃。
    Inactive,
    /// 恰好一个收集器；开启短路 (short-circuit) 时帧通过同步调用直接交付，不经过缓冲池。
    Single,
    /// 多个收集器；帧总是通过共享缓冲池交付，每个收集器按自己的节奏读取同一个物理缓冲区。
    Shared,
}

impl DistributionMode {
    /// 给定收集器数量时应处的分发模式。
    pub fn for_collector_count(count: usize) -> Self {
        match count {
            0 => DistributionMode::Inactive,
            1 => DistributionMode::Single,
            _ => DistributionMode::Shared,
        }
    }
}

impl fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistributionMode::Inactive => "INACTIVE",
            DistributionMode::Single => "SINGLE",
            DistributionMode::Shared => "SHARED",
        };
        f.write_str(name)
    }
}

/// 分发器应对拥塞的路由状态（按分发器而非按收集器）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingMode {
    /// 默认：从缓冲池分配 bucket 并交给所有收集器。
    InMemoryRoute,
    /// 缓冲池耗尽且有策略允许时，帧被追加到磁盘溢出日志。
    SpillToDisk,
    /// 缓冲池耗尽且没有策略允许溢出时，帧被丢弃，只累计计数。
    Discard,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingMode::InMemoryRoute => "IN_MEMORY_ROUTE",
            RoutingMode::SpillToDisk => "SPILL_TO_DISK",
            RoutingMode::Discard => "DISCARD",
        };
        f.write_str(name)
    }
}

/// 帧收集器的生命周期状态：ACTIVE → TRANSITION → FINISHED。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorState {
    /// 正常转发。
    Active,
    /// 分发器刚刚改变了拓扑，帧仍然经由缓冲池缓冲，而不是短路交付。
    Transition,
    /// 已处理并转发结束标记，工作任务已退出。
    Finished,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorState::Active => "ACTIVE",
            CollectorState::Transition => "TRANSITION",
            CollectorState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// 监控缓冲区上报给回调的流控事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEvent {
    NoOp,
    /// 待处理帧数连续多个采样周期超过阈值，表示上游拥塞。
    PendingWorkThresholdReached,
    /// 阈值事件之后队列已经排空。
    PendingWorkDone,
    /// 处理完结束标记 (EOD)。
    FinishedProcessing,
    /// 处理完溢出结束标记 (EOSD)。
    FinishedProcessingSpillage,
}

/// 收集器输入端当前处理的数据来源。
/// 回放溢出数据或积压数据期间不统计流入速率，也不触发拥塞事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputMode {
    Process,
    ProcessSpill,
    ProcessBacklog,
}

// --- 上报消息 (Reports sent to the coordinator) ---

/// 某个运行时报告的拥塞：流入速率持续高于流出速率。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionReport {
    pub connection_id: FeedConnectionId,
    pub runtime_id: FeedRuntimeId,
    /// 流入速率 (tuples/sec)。
    pub inflow_rate: i64,
    /// 流出速率 (tuples/sec)。
    pub outflow_rate: i64,
}

/// compute 阶段提出的缩容建议。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleInReport {
    pub connection_id: FeedConnectionId,
    pub runtime_type: FeedRuntimeType,
    pub current_cardinality: usize,
    pub reduced_cardinality: usize,
}

/// store 阶段的持久化延迟违约报告。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageReport {
    pub connection_id: FeedConnectionId,
    pub partition: usize,
    /// 平均持久化延迟 (毫秒)。
    pub avg_delay_persistence_ms: u64,
    pub delay_within_limit: bool,
}

/// 某个 intake 分区中某个窗口 (base) 的提交确认。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAckMessage {
    pub connection_id: FeedConnectionId,
    pub intake_partition: u32,
    pub base: u64,
    /// 窗口内已持久化记录的位图。
    pub ack_info: Bytes,
}

/// 运行时发送给协调器/消息服务的所有消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Congestion(CongestionReport),
    ScaleIn(ScaleInReport),
    Storage(StorageReport),
    CommitAck(CommitAckMessage),
}

// --- 状态快照 (Status Snapshots) ---

/// 单个收集器的状态快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorStatus {
    pub writer_id: WriterId,
    pub state: CollectorState,
    /// 工作任务是否已启动并仍在运行。
    pub worker_running: bool,
    /// 收件箱中尚未处理的 bucket 数。
    pub pending_work: usize,
}

/// 分发器的状态快照，由 `status()` 和 `close()` 返回。
#[derive(Debug, Clone, Default)]
pub struct DistributorStatus {
    pub distribution_mode: Option<DistributionMode>,
    pub routing_mode: Option<RoutingMode>,
    pub collectors: Vec<CollectorStatus>,
    pub pool_capacity: Option<usize>,
    pub pool_available: Option<usize>,
    /// 经由缓冲池交付的帧数。
    pub in_memory_frames: u64,
    /// 通过短路同步交付的帧数。
    pub short_circuit_frames: u64,
    pub spilled_frames: u64,
    pub replayed_frames: u64,
    pub discarded_frames: u64,
    /// 仍留在溢出日志中尚未回放的帧数。
    pub pending_spilled_frames: u64,
    /// 三个帧处理器的文字摘要。
    pub summaries: Vec<String>,
}

impl DistributorStatus {
    /// 查找某个写入端对应收集器的状态。
    pub fn collector(&self, writer_id: &str) -> Option<&CollectorStatus> {
        self.collectors.iter().find(|c| c.writer_id == writer_id)
    }
}

// --- 请求结构体 (Request Structures for Handle -> Distributor Communication) ---

/// 注册/注销请求的回复通道发送端，成功时返回操作后的分发模式。
pub type TopologyReplyTx = oneshot::Sender<Result<DistributionMode, DistributorError>>;

/// `next_frame` 请求的回复通道发送端，成功时返回处理该帧时的路由模式。
pub type FrameReplyTx = oneshot::Sender<Result<RoutingMode, DistributorError>>;

/// `close` 请求的回复通道发送端，返回关闭时的最终状态快照。
pub type CloseReplyTx = oneshot::Sender<Result<DistributorStatus, DistributorError>>;

/// 枚举类型，代表所有可能通过 `DistributorHandle` 发送给分发器 actor 的请求。
///
/// actor 串行处理这些请求，这就是每个分发器唯一的一把“粗粒度锁”。
#[derive(Debug)]
pub enum Request {
    /// 注册一个新的帧收集器。
    Register {
        collector: FrameCollector,
        reply_tx: TopologyReplyTx,
    },
    /// 注销某个写入端对应的帧收集器。
    Deregister {
        writer_id: WriterId,
        reply_tx: TopologyReplyTx,
    },
    /// 上游产生的下一帧。
    NextFrame { frame: Bytes, reply_tx: FrameReplyTx },
    /// 向所有收集器发送结束标记 (EOD)。
    EndOfFeed { reply_tx: oneshot::Sender<()> },
    /// 查询写入端是否已注册。
    IsRegistered {
        writer_id: WriterId,
        reply_tx: oneshot::Sender<bool>,
    },
    /// 查询状态快照。
    Status {
        reply_tx: oneshot::Sender<DistributorStatus>,
    },
    /// 运行时并行度已改变，转告所有收集器的监控缓冲区。
    SetPartitions {
        partitions: usize,
        reply_tx: oneshot::Sender<()>,
    },
    /// 协调器对提交确认的回复，转告所有收集器的存储跟踪任务。
    CommitAckResponse {
        intake_partition: u32,
        max_window_acked: u64,
        reply_tx: oneshot::Sender<()>,
    },
    /// 排空并关闭分发器；这是唯一会阻塞调用者直到所有收集器 FINISHED 的操作。
    Close { reply_tx: CloseReplyTx },
}
