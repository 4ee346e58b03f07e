//! 库内使用的默认常量。
//! `FeedConfig::default()` 与 `FeedPolicyAccessor` 在未显式配置时回退到这些值。

use std::time::Duration;

/// 默认帧大小 (字节)。
pub const DEFAULT_FRAME_SIZE: usize = 32 * 1024;

/// 每个分发器缓冲池中 bucket 的默认数量。
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// 分发器请求通道的默认容量。
pub const DEFAULT_REQUEST_CHANNEL_SIZE: usize = 128;

/// 数据流速率 (拥塞检测) 采样周期。
pub const MONITOR_FREQUENCY: Duration = Duration::from_secs(2);

/// 处理速率 (缩容检测) 采样周期。
pub const PROCESSING_RATE_MEASURE_FREQUENCY: Duration = Duration::from_secs(10);

/// 存储阶段持久化延迟的采样周期。
pub const STORAGE_TIME_TRACKING_FREQUENCY: Duration = Duration::from_secs(5);

/// 每处理多少帧刷新一次处理速率样本。
pub const PROCESS_RATE_REFRESH: usize = 2;

/// 待处理帧数超过该值视为一次“超阈值”采样。
pub const PENDING_WORK_THRESHOLD: usize = 10;

/// 连续超阈值的采样周期数超过该值时上报拥塞。
pub const MAX_SUCCESSIVE_THRESHOLD_PERIODS: usize = 2;

/// 持久化延迟连续超限的采样次数超过该值时上报存储报告。
pub const PERSISTENCE_DELAY_VIOLATION_MAX: usize = 5;

/// 记录持久化的默认最大允许延迟 (毫秒)。
pub const DEFAULT_MAX_DELAY_RECORD_PERSISTENCE_MS: u64 = 1000;

/// 提交确认窗口大小：`record_id / ACK_WINDOW_SIZE` 即所属窗口 (base)。
pub const ACK_WINDOW_SIZE: u64 = 1024;

/// 每个 intake 分区最多跟踪的未确认窗口数；超出时丢弃最旧的窗口。
pub const MAX_TRACKED_WINDOWS_PER_PARTITION: usize = 64;

/// intake 阶段帧缓存最多保留的帧数；超出时丢弃最旧的帧。
pub const MAX_CACHED_FRAMES: usize = 1024;

/// 关闭时等待收集器结束的单次超时；超时后记录日志并继续等待。
pub const DRAIN_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// 协调器修改作业拓扑后，重新提交作业前的等待时间。
pub const COORDINATOR_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// 速率统计的默认滑动窗口。
pub const METRIC_WINDOW: Duration = Duration::from_secs(5);
