//! 运行时配置 (`FeedConfig`) 与 feed 摄取策略 (`FeedPolicyAccessor`)。

use crate::defaults;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// 分发器、收集器和监控任务共享的运行时配置。
///
/// 所有字段都有默认值，可通过 `with_*` 方法按需覆盖：
///
/// ```
/// use feed_flow::FeedConfig;
/// use std::num::NonZeroUsize;
/// let capacity = NonZeroUsize::new(8).unwrap();
/// let config = FeedConfig::default().with_pool_capacity(capacity).with_frame_size(1024);
/// assert_eq!(config.pool_capacity.get(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// 每帧字节数。
    pub frame_size: usize,
    /// 每个分发器缓冲池的 bucket 数量。容量为 0 的池无法排空溢出日志，因此不允许。
    pub pool_capacity: NonZeroUsize,
    /// 分发器请求通道的容量。
    pub request_channel_size: NonZeroUsize,
    /// 单收集器时是否允许绕过缓冲池直接同步交付。
    pub short_circuit: bool,
    /// 溢出日志所在目录。
    pub spill_dir: PathBuf,
    pub monitor_frequency: Duration,
    pub processing_rate_frequency: Duration,
    pub storage_frequency: Duration,
    pub pending_work_threshold: usize,
    pub max_successive_threshold_periods: usize,
    pub persistence_delay_violation_max: usize,
    pub process_rate_refresh: usize,
    pub drain_log_interval: Duration,
    pub settle_delay: Duration,
    pub metric_window: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            frame_size: defaults::DEFAULT_FRAME_SIZE,
            pool_capacity: NonZeroUsize::new(defaults::DEFAULT_POOL_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            request_channel_size: NonZeroUsize::new(defaults::DEFAULT_REQUEST_CHANNEL_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            short_circuit: true,
            spill_dir: std::env::temp_dir(),
            monitor_frequency: defaults::MONITOR_FREQUENCY,
            processing_rate_frequency: defaults::PROCESSING_RATE_MEASURE_FREQUENCY,
            storage_frequency: defaults::STORAGE_TIME_TRACKING_FREQUENCY,
            pending_work_threshold: defaults::PENDING_WORK_THRESHOLD,
            max_successive_threshold_periods: defaults::MAX_SUCCESSIVE_THRESHOLD_PERIODS,
            persistence_delay_violation_max: defaults::PERSISTENCE_DELAY_VIOLATION_MAX,
            process_rate_refresh: defaults::PROCESS_RATE_REFRESH,
            drain_log_interval: defaults::DRAIN_LOG_INTERVAL,
            settle_delay: defaults::COORDINATOR_SETTLE_DELAY,
            metric_window: defaults::METRIC_WINDOW,
        }
    }
}

impl FeedConfig {
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_pool_capacity(mut self, pool_capacity: NonZeroUsize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    pub fn with_request_channel_size(mut self, size: NonZeroUsize) -> Self {
        self.request_channel_size = size;
        self
    }

    pub fn with_short_circuit(mut self, enabled: bool) -> Self {
        self.short_circuit = enabled;
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }

    pub fn with_monitor_frequency(mut self, period: Duration) -> Self {
        self.monitor_frequency = period;
        self
    }

    pub fn with_processing_rate_frequency(mut self, period: Duration) -> Self {
        self.processing_rate_frequency = period;
        self
    }

    pub fn with_storage_frequency(mut self, period: Duration) -> Self {
        self.storage_frequency = period;
        self
    }

    pub fn with_pending_work_threshold(mut self, threshold: usize) -> Self {
        self.pending_work_threshold = threshold;
        self
    }

    pub fn with_drain_log_interval(mut self, interval: Duration) -> Self {
        self.drain_log_interval = interval;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

// --- 策略参数名 (Policy parameter keys) ---

pub const SPILL_TO_DISK_ON_CONGESTION: &str = "spill.to.disk.on.congestion";
pub const TIME_TRACKING: &str = "time.tracking";
pub const MAX_DELAY_RECORD_PERSISTENCE: &str = "max.delay.record.persistence";
pub const EXCESS_RECORDS_DISCARD: &str = "excess.records.discard";
pub const RECOVER_SOFT_FAILURE: &str = "recover.soft.failure";

/// 某个订阅者 (收集器) 的摄取策略，由字符串参数表解析得到。
///
/// 无法识别的取值会回退为默认值并记录 WARN 日志，不会让订阅失败。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPolicyAccessor {
    spill_to_disk_on_congestion: bool,
    time_tracking: bool,
    max_delay_record_persistence_ms: u64,
    excess_records_discard: bool,
    recover_soft_failure: bool,
}

impl Default for FeedPolicyAccessor {
    fn default() -> Self {
        Self {
            spill_to_disk_on_congestion: false,
            time_tracking: false,
            max_delay_record_persistence_ms: defaults::DEFAULT_MAX_DELAY_RECORD_PERSISTENCE_MS,
            excess_records_discard: false,
            recover_soft_failure: true,
        }
    }
}

fn parse_bool(params: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match params.get(key) {
        None => default,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => true,
            "false" => false,
            other => {
                warn!(
                    "(Policy) 参数 {} 的取值 '{}' 无法解析为布尔值，使用默认值 {}",
                    key, other, default
                );
                default
            }
        },
    }
}

impl FeedPolicyAccessor {
    /// 从策略参数表构造。
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let max_delay = match params.get(MAX_DELAY_RECORD_PERSISTENCE) {
            None => defaults.max_delay_record_persistence_ms,
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!(
                    "(Policy) 参数 {} 的取值 '{}' 无法解析为毫秒数，使用默认值 {}",
                    MAX_DELAY_RECORD_PERSISTENCE, raw, defaults.max_delay_record_persistence_ms
                );
                defaults.max_delay_record_persistence_ms
            }),
        };
        Self {
            spill_to_disk_on_congestion: parse_bool(
                params,
                SPILL_TO_DISK_ON_CONGESTION,
                defaults.spill_to_disk_on_congestion,
            ),
            time_tracking: parse_bool(params, TIME_TRACKING, defaults.time_tracking),
            max_delay_record_persistence_ms: max_delay,
            excess_records_discard: parse_bool(
                params,
                EXCESS_RECORDS_DISCARD,
                defaults.excess_records_discard,
            ),
            recover_soft_failure: parse_bool(
                params,
                RECOVER_SOFT_FAILURE,
                defaults.recover_soft_failure,
            ),
        }
    }

    pub fn with_spill_to_disk(mut self, enabled: bool) -> Self {
        self.spill_to_disk_on_congestion = enabled;
        self
    }

    pub fn with_time_tracking(mut self, enabled: bool) -> Self {
        self.time_tracking = enabled;
        self
    }

    pub fn with_max_delay_record_persistence_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_record_persistence_ms = max_delay_ms;
        self
    }

    pub fn with_recover_soft_failure(mut self, enabled: bool) -> Self {
        self.recover_soft_failure = enabled;
        self
    }

    pub fn spill_to_disk_on_congestion(&self) -> bool {
        self.spill_to_disk_on_congestion
    }

    pub fn time_tracking(&self) -> bool {
        self.time_tracking
    }

    pub fn max_delay_record_persistence_ms(&self) -> u64 {
        self.max_delay_record_persistence_ms
    }

    pub fn excess_records_discard(&self) -> bool {
        self.excess_records_discard
    }

    /// 元组级数据错误是否可以跳过 (切片后继续)。
    pub fn recover_soft_failure(&self) -> bool {
        self.recover_soft_failure
    }
}
