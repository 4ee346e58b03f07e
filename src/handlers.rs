//! 三种帧处理器：内存路由、溢出到磁盘、丢弃。
//!
//! 分发器按当前的 `RoutingMode` 选择处理器。每个处理器维护自己的计数与文字摘要，
//! 关闭或丢弃帧时会打印这些摘要。

use crate::bucket::DataBucket;
use crate::collector::FrameCollector;
use crate::error::FeedError;
use crate::frame::tuple_count_lossy;
use crate::types::RoutingMode;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// 把同一个 bucket 交给所有收集器。
#[derive(Debug, Default)]
pub struct InMemoryHandler {
    frames: u64,
    tuples: u64,
}

impl InMemoryHandler {
    pub fn handle_data_bucket<'a, I>(&mut self, bucket: Arc<DataBucket>, collectors: I)
    where
        I: IntoIterator<Item = &'a FrameCollector>,
    {
        self.frames += 1;
        self.tuples += tuple_count_lossy(bucket.content()) as u64;
        for collector in collectors {
            collector.send_message(Arc::clone(&bucket));
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn summary(&self) -> String {
        format!(
            "内存路由: 已交付 {} 帧 ({} 个元组)",
            self.frames, self.tuples
        )
    }
}

/// 追加写的溢出日志，按写入顺序回放。
///
/// 每条记录就是原始帧字节，没有头部：帧大小固定，第 `i` 条记录位于 `i * frame_size`。
#[derive(Debug)]
pub struct DiskSpillHandler {
    path: PathBuf,
    frame_size: usize,
    file: Option<File>,
    write_offset: u64,
    read_offset: u64,
    /// 上一次 `peek_next` 读到的帧尚未 `advance`。
    peeked: bool,
    pending: u64,
    spilled_total: u64,
    replayed_total: u64,
}

impl DiskSpillHandler {
    pub fn new(path: PathBuf, frame_size: usize) -> Self {
        Self {
            path,
            frame_size,
            file: None,
            write_offset: 0,
            read_offset: 0,
            peeked: false,
            pending: 0,
            spilled_total: 0,
            replayed_total: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn file(&mut self) -> Result<&mut File, FeedError> {
        if self.file.is_none() {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir).await?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .await?;
            info!("(SpillHandler) 创建溢出日志 {}", self.path.display());
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| FeedError::Writer("溢出日志未打开".to_string()))
    }

    /// 把一帧追加到溢出日志末尾。
    pub async fn handle_frame(&mut self, frame: &Bytes) -> Result<(), FeedError> {
        if frame.len() != self.frame_size {
            return Err(FeedError::MalformedFrame(format!(
                "溢出帧长度 {} 与记录大小 {} 不一致",
                frame.len(),
                self.frame_size
            )));
        }
        let offset = self.write_offset;
        let file = self.file().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(frame).await?;
        file.flush().await?;
        self.write_offset += self.frame_size as u64;
        self.pending += 1;
        self.spilled_total += 1;
        debug!(
            "(SpillHandler) 溢出一帧，日志中待回放 {} 帧",
            self.pending
        );
        Ok(())
    }

    /// 读取下一条待回放的帧但不前进。
    pub async fn peek_next(&mut self) -> Result<Option<Bytes>, FeedError> {
        if self.pending == 0 {
            return Ok(None);
        }
        let offset = self.read_offset;
        let mut frame = BytesMut::zeroed(self.frame_size);
        let file = self.file().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut frame).await?;
        self.peeked = true;
        Ok(Some(frame.freeze()))
    }

    /// 确认上一次 `peek_next` 读到的帧已经交付。
    pub fn advance(&mut self) {
        if std::mem::take(&mut self.peeked) {
            self.read_offset += self.frame_size as u64;
            self.pending -= 1;
            self.replayed_total += 1;
        }
    }

    /// 日志已全部回放时截断文件并重置读写位置，返回是否发生了截断。
    pub async fn reset_if_drained(&mut self) -> Result<bool, FeedError> {
        if self.pending > 0 || self.write_offset == 0 {
            return Ok(false);
        }
        if let Some(file) = self.file.as_mut() {
            file.set_len(0).await?;
        }
        self.write_offset = 0;
        self.read_offset = 0;
        self.peeked = false;
        info!(
            "(SpillHandler) 溢出日志已全部回放 (累计 {} 帧)，已截断",
            self.replayed_total
        );
        Ok(true)
    }

    /// 关闭并删除溢出文件。
    pub async fn close(&mut self) -> Result<(), FeedError> {
        if self.file.take().is_some() {
            match fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// 日志中尚未回放的帧数。
    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn spilled_total(&self) -> u64 {
        self.spilled_total
    }

    pub fn replayed_total(&self) -> u64 {
        self.replayed_total
    }

    pub fn summary(&self) -> String {
        format!(
            "溢出到磁盘: 累计溢出 {} 帧, 已回放 {} 帧, 待回放 {} 帧 ({})",
            self.spilled_total,
            self.replayed_total,
            self.pending,
            self.path.display()
        )
    }
}

/// 丢弃帧，只计数。
#[derive(Debug, Default)]
pub struct DiscardHandler {
    frames: u64,
    tuples: u64,
}

impl DiscardHandler {
    pub fn handle_frame(&mut self, frame: &Bytes) {
        self.frames += 1;
        self.tuples += tuple_count_lossy(frame) as u64;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn tuples(&self) -> u64 {
        self.tuples
    }

    pub fn summary(&self) -> String {
        format!("丢弃: 累计丢弃 {} 帧 ({} 个元组)", self.frames, self.tuples)
    }
}

/// 一个分发器的三个处理器。
#[derive(Debug)]
pub struct FrameHandlers {
    pub in_memory: InMemoryHandler,
    pub spill: DiskSpillHandler,
    pub discard: DiscardHandler,
}

impl FrameHandlers {
    pub fn new(spill_path: PathBuf, frame_size: usize) -> Self {
        Self {
            in_memory: InMemoryHandler::default(),
            spill: DiskSpillHandler::new(spill_path, frame_size),
            discard: DiscardHandler::default(),
        }
    }

    /// 某个路由模式对应处理器的摘要。
    pub fn summary(&self, mode: RoutingMode) -> String {
        match mode {
            RoutingMode::InMemoryRoute => self.in_memory.summary(),
            RoutingMode::SpillToDisk => self.spill.summary(),
            RoutingMode::Discard => self.discard.summary(),
        }
    }

    pub fn summaries(&self) -> Vec<String> {
        [
            RoutingMode::InMemoryRoute,
            RoutingMode::SpillToDisk,
            RoutingMode::Discard,
        ]
        .into_iter()
        .map(|mode| self.summary(mode))
        .collect()
    }
}
