//! 帧收集器：分发器与一个下游写入端之间的桥梁。
//!
//! 每个收集器拥有一个收件箱和一个工作任务。分发器把 bucket 放进收件箱后立即返回，
//! 工作任务按自己的节奏把帧交给监控缓冲区转发。单收集器短路时，分发器直接调用
//! `next_frame` 同步交付，不经过收件箱。

use crate::bucket::{BucketReader, ContentType, DataBucket};
use crate::config::FeedPolicyAccessor;
use crate::error::FeedError;
use crate::frame::tuple_count_lossy;
use crate::monitor::{InflowReporter, MonitorContext, MonitoredBuffer, SharedInputMode, SharedWriter};
use crate::types::{CollectorState, CollectorStatus, InputMode, WriterId};
use crate::writer::FrameWriter;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

type Inbox = mpsc::UnboundedReceiver<Arc<DataBucket>>;

/// 收集器与其工作任务共享的部分。
struct CollectorShared {
    writer_id: WriterId,
    writer: SharedWriter,
    buffer: tokio::sync::Mutex<MonitoredBuffer>,
    pending: Arc<AtomicUsize>,
    state: watch::Sender<CollectorState>,
    writer_closed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl CollectorShared {
    fn set_state(&self, state: CollectorState) {
        self.state.send_replace(state);
    }

    fn record_error(&self, message: String) {
        match self.last_error.lock() {
            Ok(mut slot) => *slot = Some(message),
            Err(poisoned) => *poisoned.into_inner() = Some(message),
        }
    }

    /// 关闭写入端，只生效一次。
    async fn close_writer(&self) -> Result<(), FeedError> {
        if self.writer_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.lock().await.close().await
    }

    /// 不可恢复的转发失败：通知下游失败并进入 FINISHED。
    async fn fail(&self, cause: &FeedError) {
        error!(
            "(Collector {}) 转发失败，收集器终止: {}",
            self.writer_id, cause
        );
        self.record_error(cause.to_string());
        self.writer_closed.store(true, Ordering::Release);
        if let Err(e) = self.writer.lock().await.fail().await {
            warn!("(Collector {}) 通知写入端失败时出错: {}", self.writer_id, e);
        }
        self.set_state(CollectorState::Finished);
    }
}

/// 一个已注册 (或即将注册) 的下游订阅者。
pub struct FrameCollector {
    shared: Arc<CollectorShared>,
    policy: FeedPolicyAccessor,
    inbox_tx: mpsc::UnboundedSender<Arc<DataBucket>>,
    inbox_rx: Option<Inbox>,
    input_mode: SharedInputMode,
    inflow: InflowReporter,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for FrameCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCollector")
            .field("writer_id", &self.shared.writer_id)
            .field("state", &self.state())
            .field("pending_work", &self.pending_work())
            .field("worker_running", &self.is_worker_running())
            .finish()
    }
}

impl FrameCollector {
    pub fn new(
        writer_id: impl Into<WriterId>,
        writer: Box<dyn FrameWriter>,
        policy: FeedPolicyAccessor,
        monitor: MonitorContext,
    ) -> Self {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let pending = Arc::new(AtomicUsize::new(0));
        let input_mode = SharedInputMode::default();
        let buffer = MonitoredBuffer::new(
            monitor,
            &policy,
            Arc::clone(&writer),
            Arc::clone(&pending),
            input_mode.clone(),
        );
        let inflow = buffer.inflow_reporter();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(CollectorState::Active);
        Self {
            shared: Arc::new(CollectorShared {
                writer_id: writer_id.into(),
                writer,
                buffer: tokio::sync::Mutex::new(buffer),
                pending,
                state,
                writer_closed: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            policy,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            input_mode,
            inflow,
            worker: None,
        }
    }

    pub fn writer_id(&self) -> &WriterId {
        &self.shared.writer_id
    }

    pub fn policy(&self) -> &FeedPolicyAccessor {
        &self.policy
    }

    pub fn state(&self) -> CollectorState {
        *self.shared.state.borrow()
    }

    pub fn set_state(&self, state: CollectorState) {
        if self.state() != CollectorState::Finished {
            debug!("(Collector {}) 状态 -> {}", self.writer_id(), state);
            self.shared.set_state(state);
        }
    }

    /// 订阅状态变化。
    pub fn subscribe_state(&self) -> watch::Receiver<CollectorState> {
        self.shared.state.subscribe()
    }

    pub fn pending_work(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn set_input_mode(&self, mode: InputMode) {
        self.input_mode.set(mode);
    }

    pub fn input_mode(&self) -> InputMode {
        self.input_mode.get()
    }

    pub fn last_error(&self) -> Option<String> {
        match self.shared.last_error.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn status(&self) -> CollectorStatus {
        CollectorStatus {
            writer_id: self.writer_id().clone(),
            state: self.state(),
            worker_running: self.is_worker_running(),
            pending_work: self.pending_work(),
        }
    }

    /// 打开下游写入端并启动采样任务。注册时由分发器调用。
    pub async fn open(&self) -> Result<(), FeedError> {
        self.shared.writer.lock().await.open().await?;
        self.shared.buffer.lock().await.start_monitoring();
        Ok(())
    }

    /// 启动工作任务。重复调用无效果。
    pub fn start(&mut self) {
        let Some(inbox) = self.inbox_rx.take() else {
            return;
        };
        info!("(Collector {}) 启动工作任务", self.writer_id());
        let shared = Arc::clone(&self.shared);
        self.worker = Some(tokio::spawn(run_worker(shared, inbox)));
    }

    /// 异步投递一个 bucket，从不阻塞。
    /// 工作任务已经退出时立即代为完成读取，不会泄漏池槽位。
    pub fn send_message(&self, bucket: Arc<DataBucket>) {
        if self.inflow.is_enabled() && bucket.content_type() == ContentType::Data {
            self.inflow.record(tuple_count_lossy(bucket.content()));
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(bucket)) = self.inbox_tx.send(bucket) {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            trace!(
                "(Collector {}) 工作任务已退出，直接完成读取",
                self.writer_id()
            );
            bucket.done_reading();
        }
    }

    /// 短路交付：同步地把一帧交给监控缓冲区。
    pub async fn next_frame(&self, frame: Bytes) -> Result<(), FeedError> {
        if self.state() == CollectorState::Finished {
            return Err(FeedError::Writer(format!(
                "收集器 {} 已结束",
                self.writer_id()
            )));
        }
        let result = self.shared.buffer.lock().await.forward_frame(frame).await;
        if let Err(e) = &result {
            self.shared.fail(e).await;
        }
        result
    }

    /// 结束这个收集器：有工作任务时投递 EOD，处理完已入队的 bucket 后关闭写入端；
    /// 否则直接关闭写入端。
    pub async fn close_collector(&self) {
        if self.state() == CollectorState::Finished {
            return;
        }
        if self.worker.is_some() {
            debug!("(Collector {}) 投递结束标记", self.writer_id());
            self.send_message(DataBucket::marker(ContentType::Eod, 1));
        } else {
            if let Err(e) = self.shared.close_writer().await {
                warn!("(Collector {}) 关闭写入端失败: {}", self.writer_id(), e);
            }
            self.shared.buffer.lock().await.close(true);
            self.shared.set_state(CollectorState::Finished);
        }
    }

    /// 关闭写入端 (若尚未关闭)。
    pub async fn disconnect(&self) {
        if let Err(e) = self.shared.close_writer().await {
            warn!("(Collector {}) 断开写入端失败: {}", self.writer_id(), e);
        }
    }

    /// 等待收集器进入 FINISHED。
    pub async fn wait_finished(&self) {
        let mut state = self.subscribe_state();
        // 发送端与收集器同生命周期，这里不会返回错误
        let _ = state.wait_for(|s| *s == CollectorState::Finished).await;
    }

    pub async fn set_number_of_partitions(&self, partitions: usize) {
        self.shared.buffer.lock().await.set_number_of_partitions(partitions);
    }

    pub async fn receive_commit_ack_response(&self, intake_partition: u32, max_window_acked: u64) {
        self.shared
            .buffer
            .lock()
            .await
            .receive_commit_ack_response(intake_partition, max_window_acked);
    }

    /// 从指定记录开始把缓存的帧重新交给写入端。
    pub async fn replay_cached(&self, start_record_id: u64) -> Result<usize, FeedError> {
        self.shared.buffer.lock().await.replay_cached(start_record_id).await
    }

    pub async fn cached_frames(&self) -> usize {
        self.shared.buffer.lock().await.cached_frames()
    }
}

/// 工作任务：逐个处理收件箱中的 bucket，直到收到 EOD 或转发失败。
async fn run_worker(shared: Arc<CollectorShared>, mut inbox: Inbox) {
    let writer_id = shared.writer_id.clone();
    debug!("(Collector {}) 工作任务开始", writer_id);
    while let Some(bucket) = inbox.recv().await {
        let reader = BucketReader::new(bucket);
        let outcome = {
            let mut buffer = shared.buffer.lock().await;
            buffer.process_message(reader.bucket()).await
        };
        reader.finish();
        // 处理完才计数减一，分发器据此判断积压是否真正清空
        shared.pending.fetch_sub(1, Ordering::AcqRel);
        match outcome {
            Ok(ContentType::Eod) => {
                if let Err(e) = shared.close_writer().await {
                    warn!("(Collector {}) 关闭写入端失败: {}", writer_id, e);
                }
                shared.buffer.lock().await.close(true);
                shared.set_state(CollectorState::Finished);
                info!("(Collector {}) 已处理结束标记，收集器结束", writer_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.buffer.lock().await.close(true);
                shared.fail(&e).await;
                break;
            }
        }
    }

    // 退出前排空收件箱，保证每个 bucket 都完成了读取
    inbox.close();
    let mut drained = 0;
    while let Ok(bucket) = inbox.try_recv() {
        shared.pending.fetch_sub(1, Ordering::AcqRel);
        bucket.done_reading();
        drained += 1;
    }
    if drained > 0 {
        warn!(
            "(Collector {}) 工作任务退出时丢弃了 {} 个未处理的 bucket",
            writer_id, drained
        );
    }
    if *shared.state.borrow() != CollectorState::Finished {
        shared.set_state(CollectorState::Finished);
    }
    debug!("(Collector {}) 工作任务结束", writer_id);
}
