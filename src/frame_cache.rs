//! intake 阶段的帧缓存。
//!
//! 已转发的帧按帧内最后一条记录的 ID 排序保存。store 阶段确认某个窗口之后，
//! 不大于该窗口末尾记录 ID 的帧被丢弃；下游要求重放时，从指定记录开始把缓存的帧
//! 重新交给写入端，第一帧从匹配的元组处切片。

use crate::defaults::MAX_CACHED_FRAMES;
use crate::error::FeedError;
use crate::frame::{slice_frame, FrameTupleAccessor};
use crate::storage::TrackingInfoExtractor;
use crate::writer::FrameWriter;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct FrameCache {
    extractor: Arc<dyn TrackingInfoExtractor>,
    frames: BTreeMap<u64, Bytes>,
    capacity: usize,
}

impl fmt::Debug for FrameCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCache")
            .field("frames", &self.frames.len())
            .field("capacity", &self.capacity)
            .field("first_record_id", &self.frames.keys().next())
            .finish()
    }
}

impl FrameCache {
    pub fn new(extractor: Arc<dyn TrackingInfoExtractor>) -> Self {
        Self {
            extractor,
            frames: BTreeMap::new(),
            capacity: MAX_CACHED_FRAMES,
        }
    }

    /// 最多保留的帧数，至少为 1。
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn record_id(&self, accessor: &FrameTupleAccessor<'_>, index: usize) -> Option<u64> {
        accessor
            .tuple(index)
            .and_then(|tuple| self.extractor.extract(tuple))
            .map(|info| info.record_id)
    }

    /// 缓存一帧，返回作为键的最后一条记录 ID。
    /// 空帧或最后一个元组没有跟踪信息的帧不缓存，返回 `None`。
    pub fn insert(&mut self, frame: Bytes) -> Result<Option<u64>, FeedError> {
        let last_record_id = {
            let accessor = FrameTupleAccessor::new(&frame)?;
            match accessor.tuple_count().checked_sub(1) {
                Some(last) => self.record_id(&accessor, last),
                None => None,
            }
        };
        let Some(last_record_id) = last_record_id else {
            trace!("(FrameCache) 帧没有可跟踪的末尾记录，不缓存");
            return Ok(None);
        };
        self.frames.insert(last_record_id, frame);
        while self.frames.len() > self.capacity {
            if let Some((evicted, _)) = self.frames.pop_first() {
                warn!(
                    "(FrameCache) 缓存已满 ({} 帧)，丢弃末尾记录为 {} 的最旧帧",
                    self.capacity, evicted
                );
            }
        }
        Ok(Some(last_record_id))
    }

    /// 丢弃末尾记录 ID 不大于 `record_id` 的帧，返回丢弃的帧数。
    pub fn drop_till_record_id(&mut self, record_id: u64) -> usize {
        let before = self.frames.len();
        match record_id.checked_add(1) {
            Some(first_kept) => self.frames = self.frames.split_off(&first_kept),
            None => self.frames.clear(),
        }
        let dropped = before - self.frames.len();
        if dropped > 0 {
            debug!(
                "(FrameCache) 记录 {} 之前的 {} 帧已确认，剩余 {} 帧",
                record_id,
                dropped,
                self.frames.len()
            );
        }
        dropped
    }

    /// 从 `start_record_id` 开始重放缓存的帧，返回交给写入端的帧数。
    ///
    /// 第一帧是末尾记录 ID 不小于 `start_record_id` 的最早一帧，从它第一个
    /// 记录 ID 不小于 `start_record_id` 的元组开始切片；之后的帧原样重放。
    pub async fn replay_records(
        &self,
        start_record_id: u64,
        writer: &mut dyn FrameWriter,
    ) -> Result<usize, FeedError> {
        let mut replayed = 0;
        for frame in self.frames.range(start_record_id..).map(|(_, frame)| frame) {
            if replayed == 0 {
                let start_tuple = {
                    let accessor = FrameTupleAccessor::new(frame)?;
                    (0..accessor.tuple_count())
                        .find(|i| {
                            self.record_id(&accessor, *i)
                                .is_some_and(|id| id >= start_record_id)
                        })
                        .unwrap_or(accessor.tuple_count())
                };
                let first = if start_tuple == 0 {
                    frame.clone()
                } else {
                    slice_frame(frame, start_tuple)?
                };
                writer.next_frame(&first).await?;
            } else {
                writer.next_frame(frame).await?;
            }
            replayed += 1;
        }
        debug!(
            "(FrameCache) 从记录 {} 开始重放了 {} 帧",
            start_record_id, replayed
        );
        Ok(replayed)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 缓存中最早一帧的末尾记录 ID。
    pub fn first_record_id(&self) -> Option<u64> {
        self.frames.keys().next().copied()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
