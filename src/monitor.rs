//! 监控缓冲区 (`MonitoredBuffer`) 与周期性采样任务。
//!
//! 每个收集器有一个监控缓冲区，负责把 bucket 中的帧转发给下游写入端，
//! 同时维护流入/流出速率、处理速率和 store 阶段的持久化统计。
//! 按运行时类型启动的采样任务：
//! - COMPUTE：数据流速率 (拥塞检测) 与处理速率 (缩容检测)；
//! - STORE 且开启时间跟踪：持久化延迟与提交确认；
//! - 其他：不启动。
//!
//! INTAKE 且开启时间跟踪时，已转发的帧保存在帧缓存中，直到对应窗口被确认。
//!
//! 各采样任务的判断逻辑是同步的 `run` 方法，由 `tokio::time::interval` 驱动。

use crate::bucket::{ContentType, DataBucket};
use crate::config::{FeedConfig, FeedPolicyAccessor};
use crate::error::FeedError;
use crate::defaults::ACK_WINDOW_SIZE;
use crate::exception::{ExceptionHandler, FeedExceptionHandler};
use crate::frame::tuple_count_lossy;
use crate::frame_cache::FrameCache;
use crate::metrics::{MetricCollector, MetricType, RateMetricCollector, ValueType};
use crate::storage::{PrefixTrackingExtractor, StorageFrameHandler, TrackingInfoExtractor};
use crate::types::{
    CommitAckMessage, CongestionReport, FeedConnectionId, FeedMessage, FeedRuntimeId,
    FeedRuntimeType, FrameEvent, InputMode, ScaleInReport, SenderId, StorageReport,
};
use crate::writer::FrameWriter;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 收集器的下游写入端，在工作任务、短路路径和关闭路径之间共享。
pub type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn FrameWriter>>>;

/// 接收流控事件的回调。
pub trait FrameEventCallback: Send + Sync {
    fn frame_event(&self, event: FrameEvent);
}

impl FrameEventCallback for mpsc::UnboundedSender<FrameEvent> {
    fn frame_event(&self, event: FrameEvent) {
        // 接收端已经不在时事件无人关心
        let _ = self.send(event);
    }
}

/// 只记录日志的回调。
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFrameEventCallback;

impl FrameEventCallback for LoggingFrameEventCallback {
    fn frame_event(&self, event: FrameEvent) {
        debug!("(MonitoredBuffer) 流控事件: {:?}", event);
    }
}

/// 在分发器与监控缓冲区之间共享的输入模式。
#[derive(Debug, Clone)]
pub struct SharedInputMode(Arc<AtomicU8>);

impl SharedInputMode {
    pub fn new(mode: InputMode) -> Self {
        Self(Arc::new(AtomicU8::new(Self::encode(mode))))
    }

    fn encode(mode: InputMode) -> u8 {
        match mode {
            InputMode::Process => 0,
            InputMode::ProcessSpill => 1,
            InputMode::ProcessBacklog => 2,
        }
    }

    pub fn get(&self) -> InputMode {
        match self.0.load(Ordering::Acquire) {
            1 => InputMode::ProcessSpill,
            2 => InputMode::ProcessBacklog,
            _ => InputMode::Process,
        }
    }

    pub fn set(&self, mode: InputMode) {
        self.0.store(Self::encode(mode), Ordering::Release);
    }

    /// 是否正在回放溢出或积压数据。
    pub fn is_replaying(&self) -> bool {
        self.get() != InputMode::Process
    }
}

impl Default for SharedInputMode {
    fn default() -> Self {
        Self::new(InputMode::Process)
    }
}

/// 构造监控缓冲区所需的上下文。
#[derive(Clone)]
pub struct MonitorContext {
    pub connection_id: FeedConnectionId,
    pub runtime_id: FeedRuntimeId,
    /// 该运行时阶段当前的并行度。
    pub partitions: usize,
    pub config: FeedConfig,
    /// 为 `false` 时不创建上报者，也不启动采样任务。
    pub monitoring: bool,
    pub metric_collector: Arc<dyn MetricCollector>,
    pub callback: Arc<dyn FrameEventCallback>,
    pub exception_handler: Arc<dyn ExceptionHandler>,
    pub tracking_extractor: Arc<dyn TrackingInfoExtractor>,
    /// 发送拥塞/缩容/存储报告与提交确认的通道。
    pub messages: Option<mpsc::UnboundedSender<FeedMessage>>,
}

impl std::fmt::Debug for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorContext")
            .field("runtime_id", &self.runtime_id.to_string())
            .field("partitions", &self.partitions)
            .field("monitoring", &self.monitoring)
            .finish()
    }
}

impl MonitorContext {
    pub fn new(runtime_id: FeedRuntimeId, config: FeedConfig) -> Self {
        let connection_id = runtime_id.connection_id.clone();
        Self {
            exception_handler: Arc::new(FeedExceptionHandler::new(connection_id.clone())),
            metric_collector: Arc::new(RateMetricCollector::new(config.metric_window)),
            connection_id,
            runtime_id,
            partitions: 1,
            config,
            monitoring: true,
            callback: Arc::new(LoggingFrameEventCallback),
            tracking_extractor: Arc::new(PrefixTrackingExtractor),
            messages: None,
        }
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitoring = enabled;
        self
    }

    pub fn with_metric_collector(mut self, collector: Arc<dyn MetricCollector>) -> Self {
        self.metric_collector = collector;
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn FrameEventCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn with_messages(mut self, messages: mpsc::UnboundedSender<FeedMessage>) -> Self {
        self.messages = Some(messages);
        self
    }
}

fn send_message(messages: &Option<mpsc::UnboundedSender<FeedMessage>>, message: FeedMessage) {
    match messages {
        Some(tx) => {
            if tx.send(message).is_err() {
                warn!("(MonitoredBuffer) 消息通道已关闭，报告被丢弃");
            }
        }
        None => debug!("(MonitoredBuffer) 未配置消息通道，报告未发送: {:?}", message),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// --- 采样任务 (Timer tasks) ---

/// 数据流速率采样时的观测值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    pub pending_work: usize,
    pub input_mode: InputMode,
    pub inflow_rate: i64,
    pub outflow_rate: i64,
}

/// 检测持续积压 (拥塞) 的采样任务。
pub struct DataFlowRateTask {
    connection_id: FeedConnectionId,
    runtime_id: FeedRuntimeId,
    threshold: usize,
    max_successive_periods: usize,
    exceed_count: usize,
    last_event: FrameEvent,
    callback: Arc<dyn FrameEventCallback>,
    messages: Option<mpsc::UnboundedSender<FeedMessage>>,
}

impl DataFlowRateTask {
    pub fn new(
        connection_id: FeedConnectionId,
        runtime_id: FeedRuntimeId,
        threshold: usize,
        max_successive_periods: usize,
        callback: Arc<dyn FrameEventCallback>,
        messages: Option<mpsc::UnboundedSender<FeedMessage>>,
    ) -> Self {
        Self {
            connection_id,
            runtime_id,
            threshold,
            max_successive_periods,
            exceed_count: 0,
            last_event: FrameEvent::NoOp,
            callback,
            messages,
        }
    }

    pub fn last_event(&self) -> FrameEvent {
        self.last_event
    }

    /// 执行一次采样，返回本次发出的事件。
    pub fn run(&mut self, snapshot: &RateSnapshot) -> Option<FrameEvent> {
        if snapshot.input_mode != InputMode::Process {
            return None;
        }
        debug!(
            "(DataFlowRate {}) 流入 {} tuples/s, 流出 {} tuples/s, 待处理 {}",
            self.runtime_id, snapshot.inflow_rate, snapshot.outflow_rate, snapshot.pending_work
        );
        match self.last_event {
            FrameEvent::NoOp | FrameEvent::PendingWorkDone | FrameEvent::FinishedProcessingSpillage => {
                if snapshot.pending_work > self.threshold {
                    self.exceed_count += 1;
                    if self.exceed_count > self.max_successive_periods {
                        self.exceed_count = 0;
                        self.last_event = FrameEvent::PendingWorkThresholdReached;
                        warn!(
                            "(DataFlowRate {}) 待处理帧数 {} 连续超过阈值 {}，上报拥塞",
                            self.runtime_id, snapshot.pending_work, self.threshold
                        );
                        send_message(
                            &self.messages,
                            FeedMessage::Congestion(CongestionReport {
                                connection_id: self.connection_id.clone(),
                                runtime_id: self.runtime_id.clone(),
                                inflow_rate: snapshot.inflow_rate,
                                outflow_rate: snapshot.outflow_rate,
                            }),
                        );
                        self.callback.frame_event(self.last_event);
                        return Some(self.last_event);
                    }
                } else {
                    self.exceed_count = 0;
                }
                None
            }
            FrameEvent::PendingWorkThresholdReached => {
                if snapshot.pending_work == 0 {
                    self.last_event = FrameEvent::PendingWorkDone;
                    info!("(DataFlowRate {}) 积压已清空", self.runtime_id);
                    self.callback.frame_event(self.last_event);
                    return Some(self.last_event);
                }
                None
            }
            FrameEvent::FinishedProcessing => None,
        }
    }
}

/// 比较处理速率与流入速率、提出缩容建议的采样任务。
pub struct ProcessingRateTask {
    connection_id: FeedConnectionId,
    runtime_id: FeedRuntimeId,
    partitions: usize,
    proposed_change: bool,
    messages: Option<mpsc::UnboundedSender<FeedMessage>>,
}

impl ProcessingRateTask {
    pub fn new(
        connection_id: FeedConnectionId,
        runtime_id: FeedRuntimeId,
        partitions: usize,
        messages: Option<mpsc::UnboundedSender<FeedMessage>>,
    ) -> Self {
        Self {
            connection_id,
            runtime_id,
            partitions,
            proposed_change: false,
            messages,
        }
    }

    pub fn number_of_partitions(&self) -> usize {
        self.partitions
    }

    /// 并行度已经改变：记录新值并允许再次提出建议。
    pub fn set_number_of_partitions(&mut self, partitions: usize) {
        self.partitions = partitions;
        self.proposed_change = false;
        info!(
            "(ProcessingRate {}) 并行度重置为 {}",
            self.runtime_id, partitions
        );
    }

    /// 执行一次采样，提出建议时返回该缩容报告。
    pub fn run(&mut self, inflow_rate: i64, processing_rate: i64) -> Option<ScaleInReport> {
        if self.proposed_change {
            debug!(
                "(ProcessingRate {}) 等待上一次缩容建议生效",
                self.runtime_id
            );
            return None;
        }
        if inflow_rate <= 0 || processing_rate <= 0 {
            return None;
        }
        if inflow_rate >= processing_rate {
            debug!("(ProcessingRate {}) 流入速率不低于处理速率", self.runtime_id);
            return None;
        }
        let n = self.partitions as i64;
        // ceil(n * inflow / processing)
        let possible = (n * inflow_rate + processing_rate - 1) / processing_rate;
        if possible >= n {
            return None;
        }
        let report = ScaleInReport {
            connection_id: self.connection_id.clone(),
            runtime_type: FeedRuntimeType::Compute,
            current_cardinality: self.partitions,
            reduced_cardinality: possible.max(1) as usize,
        };
        info!(
            "(ProcessingRate {}) 建议缩容: {} -> {}",
            self.runtime_id, report.current_cardinality, report.reduced_cardinality
        );
        send_message(&self.messages, FeedMessage::ScaleIn(report.clone()));
        self.proposed_change = true;
        Some(report)
    }
}

/// store 阶段的持久化延迟采样与提交确认任务。
pub struct StorageTimeTask {
    connection_id: FeedConnectionId,
    partition: usize,
    max_delay_ms: u64,
    violation_max: usize,
    count_delay_exceeded: usize,
    max_base_acked: HashMap<u32, u64>,
    storage: Arc<Mutex<StorageFrameHandler>>,
    messages: Option<mpsc::UnboundedSender<FeedMessage>>,
}

impl StorageTimeTask {
    pub fn new(
        connection_id: FeedConnectionId,
        partition: usize,
        policy: &FeedPolicyAccessor,
        violation_max: usize,
        storage: Arc<Mutex<StorageFrameHandler>>,
        messages: Option<mpsc::UnboundedSender<FeedMessage>>,
    ) -> Self {
        Self {
            connection_id,
            partition,
            max_delay_ms: policy.max_delay_record_persistence_ms(),
            violation_max,
            count_delay_exceeded: 0,
            max_base_acked: HashMap::new(),
            storage,
            messages,
        }
    }

    /// 执行一次采样，返回本次发送的所有消息。
    pub fn run(&mut self) -> Vec<FeedMessage> {
        let mut sent = Vec::new();
        let mut storage = match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for intake_partition in storage.partitions_with_stats() {
            let acked = self.max_base_acked.get(&intake_partition).copied();
            if let Some(bases) = storage.base_acks_for_partition(intake_partition) {
                for (base, stats) in bases {
                    if acked.map_or(true, |max| *base > max) {
                        sent.push(FeedMessage::CommitAck(CommitAckMessage {
                            connection_id: self.connection_id.clone(),
                            intake_partition,
                            base: *base,
                            ack_info: stats.ack_info(),
                        }));
                    }
                }
            }
        }

        if let Some(avg_delay) = storage.sample_avg_delay() {
            if avg_delay > self.max_delay_ms {
                self.count_delay_exceeded += 1;
                if self.count_delay_exceeded > self.violation_max {
                    warn!(
                        "(StorageTime {}[{}]) 平均持久化延迟 {}ms 连续超过上限 {}ms",
                        self.connection_id, self.partition, avg_delay, self.max_delay_ms
                    );
                    sent.push(FeedMessage::Storage(StorageReport {
                        connection_id: self.connection_id.clone(),
                        partition: self.partition,
                        avg_delay_persistence_ms: avg_delay,
                        delay_within_limit: false,
                    }));
                    self.count_delay_exceeded = 0;
                }
            } else {
                self.count_delay_exceeded = 0;
            }
        }
        drop(storage);

        for message in &sent {
            send_message(&self.messages, message.clone());
        }
        sent
    }

    /// 收到提交确认的回复：推进该分区已确认的最大窗口，并丢弃已确认的窗口。
    pub fn receive_commit_ack_response(&mut self, intake_partition: u32, max_window_acked: u64) {
        debug!(
            "(StorageTime {}) 分区 {} 已确认到窗口 {}",
            self.connection_id, intake_partition, max_window_acked
        );
        let entry = self.max_base_acked.entry(intake_partition).or_insert(max_window_acked);
        if max_window_acked > *entry {
            *entry = max_window_acked;
        }
        let mut storage = match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        storage.prune_acknowledged(intake_partition, *entry);
    }

    pub fn max_base_acked(&self, intake_partition: u32) -> Option<u64> {
        self.max_base_acked.get(&intake_partition).copied()
    }
}

fn lock_task<T>(task: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match task.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// 以固定速率周期执行 `tick`。第一次立即执行。
fn spawn_periodic<F>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        loop {
            interval.tick().await;
            tick();
        }
    })
}

// --- 监控缓冲区 (Monitored buffer) ---

/// 带监控的帧转发器。
pub struct MonitoredBuffer {
    connection_id: FeedConnectionId,
    runtime_id: FeedRuntimeId,
    config: FeedConfig,
    writer: SharedWriter,
    exception_handler: Arc<dyn ExceptionHandler>,
    recover_soft_failure: bool,
    callback: Arc<dyn FrameEventCallback>,
    metric_collector: Arc<dyn MetricCollector>,
    inflow_sender: Option<SenderId>,
    outflow_sender: Option<SenderId>,
    pending: Arc<AtomicUsize>,
    input_mode: SharedInputMode,
    processing_rate_enabled: bool,
    processing_rate: Arc<AtomicI64>,
    frame_count: usize,
    storage: Option<Arc<Mutex<StorageFrameHandler>>>,
    frame_cache: Option<FrameCache>,
    data_flow_task: Option<Arc<Mutex<DataFlowRateTask>>>,
    processing_task: Option<Arc<Mutex<ProcessingRateTask>>>,
    storage_task: Option<Arc<Mutex<StorageTimeTask>>>,
    timers: Vec<JoinHandle<()>>,
    active: bool,
}

impl MonitoredBuffer {
    pub fn new(
        context: MonitorContext,
        policy: &FeedPolicyAccessor,
        writer: SharedWriter,
        pending: Arc<AtomicUsize>,
        input_mode: SharedInputMode,
    ) -> Self {
        let runtime_type = context.runtime_id.runtime_type;
        let monitoring = context.monitoring;
        let track_data_movement = monitoring && runtime_type == FeedRuntimeType::Compute;
        let storage_tracking =
            monitoring && runtime_type == FeedRuntimeType::Store && policy.time_tracking();
        let frame_cache = (runtime_type == FeedRuntimeType::Intake && policy.time_tracking())
            .then(|| FrameCache::new(Arc::clone(&context.tracking_extractor)));

        let (inflow_sender, outflow_sender) = if track_data_movement {
            (
                Some(context.metric_collector.create_report_sender(
                    &context.connection_id,
                    &context.runtime_id,
                    ValueType::InflowRate,
                    MetricType::Rate,
                )),
                Some(context.metric_collector.create_report_sender(
                    &context.connection_id,
                    &context.runtime_id,
                    ValueType::OutflowRate,
                    MetricType::Rate,
                )),
            )
        } else {
            (None, None)
        };

        let data_flow_task = track_data_movement.then(|| {
            Arc::new(Mutex::new(DataFlowRateTask::new(
                context.connection_id.clone(),
                context.runtime_id.clone(),
                context.config.pending_work_threshold,
                context.config.max_successive_threshold_periods,
                Arc::clone(&context.callback),
                context.messages.clone(),
            )))
        });
        let processing_task = track_data_movement.then(|| {
            Arc::new(Mutex::new(ProcessingRateTask::new(
                context.connection_id.clone(),
                context.runtime_id.clone(),
                context.partitions,
                context.messages.clone(),
            )))
        });

        let storage = storage_tracking.then(|| {
            let extractor = Arc::clone(&context.tracking_extractor);
            Arc::new(Mutex::new(StorageFrameHandler::new(Box::new(SharedExtractor(
                extractor,
            )))))
        });
        let storage_task = storage.as_ref().map(|storage| {
            Arc::new(Mutex::new(StorageTimeTask::new(
                context.connection_id.clone(),
                context.runtime_id.partition,
                policy,
                context.config.persistence_delay_violation_max,
                Arc::clone(storage),
                context.messages.clone(),
            )))
        });

        Self {
            connection_id: context.connection_id,
            runtime_id: context.runtime_id,
            config: context.config,
            writer,
            exception_handler: context.exception_handler,
            recover_soft_failure: policy.recover_soft_failure(),
            callback: context.callback,
            metric_collector: context.metric_collector,
            inflow_sender,
            outflow_sender,
            pending,
            input_mode,
            processing_rate_enabled: track_data_movement,
            processing_rate: Arc::new(AtomicI64::new(-1)),
            frame_count: 0,
            storage,
            frame_cache,
            data_flow_task,
            processing_task,
            storage_task,
            timers: Vec::new(),
            active: true,
        }
    }

    /// 启动采样任务。必须在 tokio 运行时中调用；重复调用无效果。
    pub fn start_monitoring(&mut self) {
        if !self.timers.is_empty() {
            return;
        }
        if let Some(task) = &self.data_flow_task {
            let task = Arc::clone(task);
            let pending = Arc::clone(&self.pending);
            let mode = self.input_mode.clone();
            let metrics = Arc::clone(&self.metric_collector);
            let (inflow, outflow) = (self.inflow_sender, self.outflow_sender);
            self.timers.push(spawn_periodic(self.config.monitor_frequency, move || {
                let snapshot = RateSnapshot {
                    pending_work: pending.load(Ordering::Acquire),
                    input_mode: mode.get(),
                    inflow_rate: inflow.map_or(0, |id| metrics.get_metric(id)),
                    outflow_rate: outflow.map_or(0, |id| metrics.get_metric(id)),
                };
                lock_task(&task).run(&snapshot);
            }));
        }
        if let Some(task) = &self.processing_task {
            let task = Arc::clone(task);
            let metrics = Arc::clone(&self.metric_collector);
            let inflow = self.inflow_sender;
            let processing_rate = Arc::clone(&self.processing_rate);
            self.timers.push(spawn_periodic(
                self.config.processing_rate_frequency,
                move || {
                    let inflow_rate = inflow.map_or(0, |id| metrics.get_metric(id));
                    lock_task(&task).run(inflow_rate, processing_rate.load(Ordering::Acquire));
                },
            ));
        }
        if let Some(task) = &self.storage_task {
            let task = Arc::clone(task);
            self.timers.push(spawn_periodic(self.config.storage_frequency, move || {
                lock_task(&task).run();
            }));
        }
        if !self.timers.is_empty() {
            info!(
                "(MonitoredBuffer {}) 已启动 {} 个采样任务",
                self.runtime_id,
                self.timers.len()
            );
        }
    }

    fn stop_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    /// 是否统计流入速率 (只有 COMPUTE 阶段统计)。
    pub fn tracks_inflow(&self) -> bool {
        self.inflow_sender.is_some()
    }

    /// 供入队一侧使用的流入统计句柄，不需要持有缓冲区的锁。
    pub fn inflow_reporter(&self) -> InflowReporter {
        InflowReporter {
            metric_collector: Arc::clone(&self.metric_collector),
            sender: self.inflow_sender,
            input_mode: self.input_mode.clone(),
        }
    }

    /// 处理一个 bucket，返回其内容类型。
    /// 调用者负责在处理后调用 `done_reading`。
    pub async fn process_message(&mut self, bucket: &DataBucket) -> Result<ContentType, FeedError> {
        if !self.active {
            return Ok(bucket.content_type());
        }
        match bucket.content_type() {
            ContentType::Data => {
                self.forward_frame(bucket.content().clone()).await?;
            }
            ContentType::Eod => {
                self.stop_timers();
                self.callback.frame_event(FrameEvent::FinishedProcessing);
            }
            ContentType::Eosd => {
                info!("(MonitoredBuffer {}) 溢出数据处理完毕", self.runtime_id);
                self.input_mode.set(InputMode::Process);
                self.callback.frame_event(FrameEvent::FinishedProcessingSpillage);
            }
        }
        Ok(bucket.content_type())
    }

    /// 把一帧转发给下游写入端。元组级错误经异常处理器切片后重试。
    pub async fn forward_frame(&mut self, frame: Bytes) -> Result<(), FeedError> {
        let outflow_tuples = tuple_count_lossy(&frame);
        if let Some(storage) = &self.storage {
            let now = now_millis();
            let result = lock_task(storage).update_tracking_information(&frame, now);
            if let Err(e) = result {
                warn!(
                    "(MonitoredBuffer {}) 更新存储跟踪信息失败: {}",
                    self.runtime_id, e
                );
            }
        }

        let mut frame = frame;
        loop {
            let started = Instant::now();
            let result = {
                let mut writer = self.writer.lock().await;
                writer.next_frame(&frame).await
            };
            match result {
                Ok(()) => {
                    if self.processing_rate_enabled {
                        self.frame_count += 1;
                        if self.frame_count % self.config.process_rate_refresh.max(1) == 0 {
                            let elapsed_ms = started.elapsed().as_millis().max(1) as i64;
                            let rate = outflow_tuples as i64 * 1000 / elapsed_ms;
                            self.processing_rate.store(rate, Ordering::Release);
                            debug!(
                                "(MonitoredBuffer {}) 处理速率 {} tuples/s",
                                self.runtime_id, rate
                            );
                            self.frame_count = 0;
                        }
                    }
                    if let Some(id) = self.outflow_sender {
                        self.metric_collector.send_report(id, outflow_tuples);
                    }
                    if let Some(cache) = self.frame_cache.as_mut() {
                        if let Err(e) = cache.insert(frame) {
                            warn!(
                                "(MonitoredBuffer {}) 缓存已转发的帧失败: {}",
                                self.runtime_id, e
                            );
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    if !(self.recover_soft_failure && e.is_frame_data_error()) {
                        error!(
                            "(MonitoredBuffer {}) 转发失败且无法恢复: {}",
                            self.runtime_id, e
                        );
                        return Err(e);
                    }
                    match self.exception_handler.handle_exception(&e, &frame) {
                        Some(sliced) => frame = sliced,
                        None => {
                            error!(
                                "(MonitoredBuffer {}) 异常处理器无法恢复: {}",
                                self.runtime_id, e
                            );
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// 停止处理。`disable_monitoring` 时同时取消采样任务并注销上报者。
    pub fn close(&mut self, disable_monitoring: bool) {
        if disable_monitoring {
            self.stop_timers();
            if let Some(storage) = &self.storage {
                lock_task(storage).clear();
            }
            if let Some(cache) = self.frame_cache.as_mut() {
                cache.clear();
            }
            for id in [self.inflow_sender.take(), self.outflow_sender.take()]
                .into_iter()
                .flatten()
            {
                self.metric_collector.remove_report_sender(id);
            }
            info!("(MonitoredBuffer {}) 已停止监控", self.runtime_id);
        }
        self.active = false;
    }

    /// 重新激活并清空速率样本。
    pub fn reset(&mut self) {
        self.active = true;
        for id in [self.inflow_sender, self.outflow_sender].into_iter().flatten() {
            self.metric_collector.reset_report_sender(id);
        }
    }

    pub fn set_number_of_partitions(&mut self, partitions: usize) {
        if let Some(task) = &self.processing_task {
            let mut task = lock_task(task);
            if task.number_of_partitions() != partitions {
                task.set_number_of_partitions(partitions);
            }
        }
    }

    /// 提交确认回复：STORE 阶段丢弃已确认的窗口统计，INTAKE 阶段丢弃已确认窗口内的缓存帧。
    pub fn receive_commit_ack_response(&mut self, intake_partition: u32, max_window_acked: u64) {
        if let Some(task) = &self.storage_task {
            lock_task(task).receive_commit_ack_response(intake_partition, max_window_acked);
        } else if let Some(cache) = self.frame_cache.as_mut() {
            // 窗口 w 覆盖记录 [w * ACK_WINDOW_SIZE, (w + 1) * ACK_WINDOW_SIZE)
            let last_acked_record = max_window_acked
                .saturating_add(1)
                .saturating_mul(ACK_WINDOW_SIZE)
                .saturating_sub(1);
            cache.drop_till_record_id(last_acked_record);
        } else {
            warn!(
                "(MonitoredBuffer {}) 未开启时间跟踪，忽略提交确认回复",
                self.runtime_id
            );
        }
    }

    /// 从 `start_record_id` 开始把缓存的帧重新交给写入端，返回重放的帧数。
    pub async fn replay_cached(&mut self, start_record_id: u64) -> Result<usize, FeedError> {
        let Some(cache) = self.frame_cache.as_ref() else {
            warn!(
                "(MonitoredBuffer {}) 未开启帧缓存，无法从记录 {} 重放",
                self.runtime_id, start_record_id
            );
            return Ok(0);
        };
        let mut writer = self.writer.lock().await;
        let replayed = cache.replay_records(start_record_id, &mut **writer).await?;
        info!(
            "(MonitoredBuffer {}) 从记录 {} 开始重放了 {} 帧",
            self.runtime_id, start_record_id, replayed
        );
        Ok(replayed)
    }

    /// 帧缓存中的帧数；未开启帧缓存时为 0。
    pub fn cached_frames(&self) -> usize {
        self.frame_cache.as_ref().map_or(0, FrameCache::len)
    }

    pub fn inflow_rate(&self) -> i64 {
        self.inflow_sender
            .map_or(0, |id| self.metric_collector.get_metric(id))
    }

    pub fn outflow_rate(&self) -> i64 {
        self.outflow_sender
            .map_or(0, |id| self.metric_collector.get_metric(id))
    }

    /// 最近一次采样的处理速率；尚未采样时为 -1。
    pub fn processing_rate(&self) -> i64 {
        self.processing_rate.load(Ordering::Acquire)
    }

    /// 尚未处理完的帧数，包括工作任务正在处理的那一帧。
    pub fn work_size(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn input_mode(&self) -> InputMode {
        self.input_mode.get()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn monitoring_tasks(&self) -> usize {
        self.timers.len()
    }

    pub fn runtime_id(&self) -> &FeedRuntimeId {
        &self.runtime_id
    }

    pub fn connection_id(&self) -> &FeedConnectionId {
        &self.connection_id
    }
}

/// 统计流入速率。新的 bucket 入队时上报；回放溢出或积压数据期间不统计。
#[derive(Clone)]
pub struct InflowReporter {
    metric_collector: Arc<dyn MetricCollector>,
    sender: Option<SenderId>,
    input_mode: SharedInputMode,
}

impl InflowReporter {
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn record(&self, tuple_count: usize) {
        if let Some(id) = self.sender {
            if !self.input_mode.is_replaying() {
                self.metric_collector.send_report(id, tuple_count);
            }
        }
    }
}

impl Drop for MonitoredBuffer {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

/// 让共享的提取器可以装箱进 `StorageFrameHandler`。
struct SharedExtractor(Arc<dyn TrackingInfoExtractor>);

impl TrackingInfoExtractor for SharedExtractor {
    fn extract(&self, tuple: &[u8]) -> Option<crate::storage::TupleTrackingInfo> {
        self.0.extract(tuple)
    }
}
