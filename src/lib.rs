// 声明模块 (Declare modules)
mod bucket; // 数据 bucket 与缓冲池
mod collector;
mod config;
mod context;
mod coordinator;
pub mod defaults; // 默认参数
mod distributor; // 分发器 actor
mod error;
mod exception;
mod frame;
mod frame_cache;
mod handle;
mod handlers;
mod metrics;
mod monitor;
mod runtime;
mod storage;
mod types;
mod writer;

// 公开导出需要被外部 (如 main 函数、集成测试) 使用的类型
pub use bucket::{BucketReader, ContentType, DataBucket, DataBucketPool, FeedMemoryManager};
pub use collector::FrameCollector;
pub use config::{
    FeedConfig, FeedPolicyAccessor, EXCESS_RECORDS_DISCARD, MAX_DELAY_RECORD_PERSISTENCE,
    RECOVER_SOFT_FAILURE, SPILL_TO_DISK_ON_CONGESTION, TIME_TRACKING,
};
pub use context::FeedContext;
pub use coordinator::{ControlMessage, FeedJobState, FeedLoadManager, JobController};
pub use distributor::FrameDistributor;
pub use error::{DistributorError, FeedError}; // 导出错误类型
pub use exception::{ExceptionHandler, FeedExceptionHandler};
pub use frame::{frame_from_tuples, slice_frame, tuple_count_lossy, FrameTupleAccessor, FrameTupleAppender};
pub use frame_cache::FrameCache;
pub use handle::DistributorHandle; // 导出 Handle
pub use handlers::{DiscardHandler, DiskSpillHandler, FrameHandlers, InMemoryHandler};
pub use metrics::{MetricCollector, MetricType, RateMetricCollector, ValueType};
pub use monitor::{
    DataFlowRateTask, FrameEventCallback, InflowReporter, LoggingFrameEventCallback,
    MonitorContext, MonitoredBuffer, ProcessingRateTask, RateSnapshot, SharedInputMode,
    SharedWriter, StorageTimeTask,
};
pub use runtime::{AdapterRuntimeManager, DistributeFeedFrameWriter, IngestionRuntime};
pub use storage::{
    IntakePartitionStatistics, PrefixTrackingExtractor, StorageFrameHandler, TrackingInfoExtractor,
    TupleTrackingInfo, TRACKING_PREFIX_LEN,
};
pub use types::{
    CollectorState, CollectorStatus, CommitAckMessage, CongestionReport, DistributionMode,
    DistributorStatus, FeedConnectionId, FeedId, FeedMessage, FeedRuntimeId, FeedRuntimeKey,
    FeedRuntimeType, FrameEvent, InputMode, RoutingMode, ScaleInReport, SenderId, StorageReport,
    WriterId, // 导出主要的数据类型
};
pub use writer::{FrameWriter, RecordingWriter, WriterLog};
