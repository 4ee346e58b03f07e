//! 下游写入端约定 (`FrameWriter`) 以及一个记录型实现 (`RecordingWriter`)。
//!
//! `RecordingWriter` 把收到的帧记录到共享的 `WriterLog` 中，可以通过信号量门控
//! 或固定延迟模拟慢速下游，也可以注入元组级错误与致命错误。示例程序、
//! 基准测试和集成测试都使用它。

use crate::error::FeedError;
use crate::frame::FrameTupleAccessor;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// 下游帧写入端。
///
/// 调用顺序为 `open` → 若干次 `next_frame` → `close`；出错时可能调用 `fail`。
/// `fail` 只向下游传播失败，不做任何分发器侧的清理。
#[async_trait]
pub trait FrameWriter: Send {
    async fn open(&mut self) -> Result<(), FeedError>;

    /// 写入一帧。元组级错误应返回 `FeedError::FrameData`，以便上层切片后重试。
    async fn next_frame(&mut self, frame: &Bytes) -> Result<(), FeedError>;

    async fn close(&mut self) -> Result<(), FeedError>;

    async fn fail(&mut self) -> Result<(), FeedError>;
}

/// `RecordingWriter` 的共享记录。
#[derive(Debug, Default)]
pub struct WriterLog {
    frames: Mutex<Vec<Bytes>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    failed: AtomicUsize,
}

impl WriterLog {
    /// 已成功写入的帧 (按到达顺序)。
    pub fn frames(&self) -> Vec<Bytes> {
        match self.frames.lock() {
            Ok(frames) => frames.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn frame_count(&self) -> usize {
        match self.frames.lock() {
            Ok(frames) => frames.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// 所有已写入帧中的元组，按顺序展开。
    pub fn tuples(&self) -> Vec<Vec<u8>> {
        self.frames()
            .iter()
            .filter_map(|frame| FrameTupleAccessor::new(frame).ok().map(|a| {
                a.tuples().map(|t| t.to_vec()).collect::<Vec<_>>()
            }))
            .flatten()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) > 0
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire) > 0
    }

    fn push(&self, frame: Bytes) {
        match self.frames.lock() {
            Ok(mut frames) => frames.push(frame),
            Err(poisoned) => poisoned.into_inner().push(frame),
        }
    }
}

type TuplePredicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// 记录收到的帧的写入端。
pub struct RecordingWriter {
    name: String,
    log: Arc<WriterLog>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
    reject_tuple: Option<TuplePredicate>,
    fatal_at_frame: Option<usize>,
    attempts: usize,
}

impl RecordingWriter {
    /// 创建写入端，返回它与共享记录。
    pub fn new(name: impl Into<String>) -> (Self, Arc<WriterLog>) {
        let log = Arc::new(WriterLog::default());
        (
            Self {
                name: name.into(),
                log: Arc::clone(&log),
                gate: None,
                delay: None,
                reject_tuple: None,
                fatal_at_frame: None,
                attempts: 0,
            },
            log,
        )
    }

    /// 每写一帧先从信号量取走一个许可；许可耗尽时写入端阻塞，模拟卡住的下游。
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// 每帧写入前固定等待一段时间，模拟慢速下游。
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 遇到满足条件的元组时报告元组级错误。
    pub fn reject_tuples_where<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.reject_tuple = Some(Box::new(predicate));
        self
    }

    /// 第 `frame_number` 次 (从 1 开始) 写入时返回不可恢复的错误。
    pub fn with_fatal_error_at(mut self, frame_number: usize) -> Self {
        self.fatal_at_frame = Some(frame_number);
        self
    }
}

#[async_trait]
impl FrameWriter for RecordingWriter {
    async fn open(&mut self) -> Result<(), FeedError> {
        self.log.opened.fetch_add(1, Ordering::AcqRel);
        debug!("(Writer {}) 已打开", self.name);
        Ok(())
    }

    async fn next_frame(&mut self, frame: &Bytes) -> Result<(), FeedError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| FeedError::Writer(format!("{} 的门控信号量已关闭", self.name)))?;
            permit.forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.attempts += 1;
        if self.fatal_at_frame == Some(self.attempts) {
            return Err(FeedError::Writer(format!(
                "{} 在第 {} 帧处发生不可恢复错误",
                self.name, self.attempts
            )));
        }
        if let Some(predicate) = &self.reject_tuple {
            let accessor = FrameTupleAccessor::new(frame)?;
            if let Some(index) = (0..accessor.tuple_count())
                .find(|i| accessor.tuple(*i).map(|t| predicate(t)).unwrap_or(false))
            {
                return Err(FeedError::FrameData {
                    tuple_index: index,
                    message: format!("{} 拒绝了该元组", self.name),
                });
            }
        }
        trace!("(Writer {}) 写入一帧 ({} 字节)", self.name, frame.len());
        self.log.push(frame.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        self.log.closed.fetch_add(1, Ordering::AcqRel);
        debug!("(Writer {}) 已关闭", self.name);
        Ok(())
    }

    async fn fail(&mut self) -> Result<(), FeedError> {
        self.log.failed.fetch_add(1, Ordering::AcqRel);
        debug!("(Writer {}) 收到失败通知", self.name);
        Ok(())
    }
}
