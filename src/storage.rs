//! store 阶段的记录跟踪：持久化延迟统计与按窗口 (base) 的提交确认位图。
//!
//! 每个元组带有 intake 阶段写入的跟踪信息 (intake 分区、记录 ID、摄入时间戳)。
//! 记录 ID 按 `ACK_WINDOW_SIZE` 划分窗口，窗口号即 base。

use crate::defaults::{ACK_WINDOW_SIZE, MAX_TRACKED_WINDOWS_PER_PARTITION};
use crate::error::FeedError;
use crate::frame::FrameTupleAccessor;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// 跟踪前缀的长度：u32 分区 + u64 记录 ID + u64 时间戳 (大端序)。
pub const TRACKING_PREFIX_LEN: usize = 20;

/// 单个元组的跟踪信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleTrackingInfo {
    pub intake_partition: u32,
    pub record_id: u64,
    pub intake_timestamp_ms: u64,
}

impl TupleTrackingInfo {
    /// 编码为 `PrefixTrackingExtractor` 可以读取的前缀。
    pub fn encode_prefix(&self) -> [u8; TRACKING_PREFIX_LEN] {
        let mut prefix = [0u8; TRACKING_PREFIX_LEN];
        prefix[..4].copy_from_slice(&self.intake_partition.to_be_bytes());
        prefix[4..12].copy_from_slice(&self.record_id.to_be_bytes());
        prefix[12..].copy_from_slice(&self.intake_timestamp_ms.to_be_bytes());
        prefix
    }
}

/// 从元组中提取跟踪信息。
pub trait TrackingInfoExtractor: Send + Sync {
    fn extract(&self, tuple: &[u8]) -> Option<TupleTrackingInfo>;
}

/// 默认提取器：读取元组开头的 20 字节跟踪前缀。
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixTrackingExtractor;

impl TrackingInfoExtractor for PrefixTrackingExtractor {
    fn extract(&self, tuple: &[u8]) -> Option<TupleTrackingInfo> {
        if tuple.len() < TRACKING_PREFIX_LEN {
            return None;
        }
        let mut partition = [0u8; 4];
        let mut record_id = [0u8; 8];
        let mut timestamp = [0u8; 8];
        partition.copy_from_slice(&tuple[..4]);
        record_id.copy_from_slice(&tuple[4..12]);
        timestamp.copy_from_slice(&tuple[12..20]);
        Some(TupleTrackingInfo {
            intake_partition: u32::from_be_bytes(partition),
            record_id: u64::from_be_bytes(record_id),
            intake_timestamp_ms: u64::from_be_bytes(timestamp),
        })
    }
}

/// 某个 intake 分区某个窗口内已持久化记录的位图。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakePartitionStatistics {
    partition: u32,
    base: u64,
    acks: Vec<u8>,
    acked: usize,
}

impl IntakePartitionStatistics {
    pub fn new(partition: u32, base: u64) -> Self {
        Self {
            partition,
            base,
            acks: vec![0u8; (ACK_WINDOW_SIZE as usize).div_ceil(8)],
            acked: 0,
        }
    }

    /// 标记一条记录已持久化。不属于本窗口的记录被忽略。
    pub fn ack_record(&mut self, record_id: u64) {
        if record_id / ACK_WINDOW_SIZE != self.base {
            return;
        }
        let offset = (record_id % ACK_WINDOW_SIZE) as usize;
        let (byte, bit) = (offset / 8, offset % 8);
        if self.acks[byte] & (1 << bit) == 0 {
            self.acks[byte] |= 1 << bit;
            self.acked += 1;
        }
    }

    pub fn is_acked(&self, record_id: u64) -> bool {
        if record_id / ACK_WINDOW_SIZE != self.base {
            return false;
        }
        let offset = (record_id % ACK_WINDOW_SIZE) as usize;
        self.acks[offset / 8] & (1 << (offset % 8)) != 0
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn acked_count(&self) -> usize {
        self.acked
    }

    /// 位图的字节表示，随提交确认消息发送。
    pub fn ack_info(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.acks.len());
        buf.put_slice(&self.acks);
        buf.freeze()
    }
}

/// store 阶段的帧跟踪处理器。
pub struct StorageFrameHandler {
    extractor: Box<dyn TrackingInfoExtractor>,
    period_delay_total_ms: u64,
    period_tuples: u64,
    last_avg_delay_ms: u64,
    stats: BTreeMap<u32, BTreeMap<u64, IntakePartitionStatistics>>,
}

impl std::fmt::Debug for StorageFrameHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFrameHandler")
            .field("period_tuples", &self.period_tuples)
            .field("last_avg_delay_ms", &self.last_avg_delay_ms)
            .field("partitions", &self.stats.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StorageFrameHandler {
    pub fn new(extractor: Box<dyn TrackingInfoExtractor>) -> Self {
        Self {
            extractor,
            period_delay_total_ms: 0,
            period_tuples: 0,
            last_avg_delay_ms: 0,
            stats: BTreeMap::new(),
        }
    }

    /// 根据即将持久化的一帧更新延迟统计与确认位图，返回被跟踪的元组数。
    pub fn update_tracking_information(&mut self, frame: &[u8], now_ms: u64) -> Result<usize, FeedError> {
        let accessor = FrameTupleAccessor::new(frame)?;
        let mut tracked = 0;
        for tuple in accessor.tuples() {
            let Some(info) = self.extractor.extract(tuple) else {
                continue;
            };
            self.period_delay_total_ms += now_ms.saturating_sub(info.intake_timestamp_ms);
            self.period_tuples += 1;
            let base = info.record_id / ACK_WINDOW_SIZE;
            let bases = self.stats.entry(info.intake_partition).or_default();
            bases
                .entry(base)
                .or_insert_with(|| IntakePartitionStatistics::new(info.intake_partition, base))
                .ack_record(info.record_id);
            // 一直收不到确认回复时，只保留最新的窗口
            while bases.len() > MAX_TRACKED_WINDOWS_PER_PARTITION {
                if let Some((evicted, _)) = bases.pop_first() {
                    warn!(
                        "(StorageFrameHandler) 分区 {} 未确认窗口过多，丢弃最旧的窗口 {}",
                        info.intake_partition, evicted
                    );
                }
            }
            tracked += 1;
        }
        trace!("(StorageFrameHandler) 本帧跟踪了 {} 个元组", tracked);
        Ok(tracked)
    }

    /// 结束当前采样周期，返回该周期内的平均持久化延迟。
    /// 周期内没有新元组时返回 `None`。
    pub fn sample_avg_delay(&mut self) -> Option<u64> {
        if self.period_tuples == 0 {
            return None;
        }
        let avg = self.period_delay_total_ms / self.period_tuples;
        self.period_delay_total_ms = 0;
        self.period_tuples = 0;
        self.last_avg_delay_ms = avg;
        Some(avg)
    }

    /// 最近一个采样周期的平均持久化延迟。
    pub fn avg_delay_persistence_ms(&self) -> u64 {
        self.last_avg_delay_ms
    }

    pub fn partitions_with_stats(&self) -> Vec<u32> {
        self.stats.keys().copied().collect()
    }

    pub fn base_acks_for_partition(&self, partition: u32) -> Option<&BTreeMap<u64, IntakePartitionStatistics>> {
        self.stats.get(&partition)
    }

    /// 丢弃所有分区的窗口与本周期的延迟样本。
    pub fn clear(&mut self) {
        if !self.stats.is_empty() {
            debug!(
                "(StorageFrameHandler) 清空 {} 个分区的确认窗口",
                self.stats.len()
            );
        }
        self.stats.clear();
        self.period_delay_total_ms = 0;
        self.period_tuples = 0;
    }

    /// 丢弃某分区中所有 base 不大于 `max_window_acked` 的窗口。
    pub fn prune_acknowledged(&mut self, partition: u32, max_window_acked: u64) {
        if let Some(bases) = self.stats.get_mut(&partition) {
            bases.retain(|base, _| *base > max_window_acked);
            if bases.is_empty() {
                self.stats.remove(&partition);
            }
        }
    }
}

impl Default for StorageFrameHandler {
    fn default() -> Self {
        Self::new(Box::new(PrefixTrackingExtractor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_from_tuples;

    fn tuple(partition: u32, record_id: u64, ts: u64) -> Vec<u8> {
        let mut t = TupleTrackingInfo {
            intake_partition: partition,
            record_id,
            intake_timestamp_ms: ts,
        }
        .encode_prefix()
        .to_vec();
        t.extend_from_slice(b"payload");
        t
    }

    #[test]
    fn test_prefix_extraction() {
        let t = tuple(3, 42, 1_000);
        let info = PrefixTrackingExtractor.extract(&t).unwrap();
        assert_eq!(info.intake_partition, 3);
        assert_eq!(info.record_id, 42);
        assert_eq!(info.intake_timestamp_ms, 1_000);
        assert!(PrefixTrackingExtractor.extract(b"short").is_none());
    }

    #[test]
    fn test_tracking_builds_acks_and_delay() {
        let mut handler = StorageFrameHandler::default();
        let t0 = tuple(0, 1, 100);
        let t1 = tuple(0, ACK_WINDOW_SIZE + 5, 300);
        let t2 = tuple(1, 7, 500);
        let frame = frame_from_tuples(512, vec![&t0[..], &t1[..], &t2[..], &b"untracked"[..]]).unwrap();
        assert_eq!(handler.update_tracking_information(&frame, 600).unwrap(), 3);

        // 延迟分别为 500, 300, 100
        assert_eq!(handler.sample_avg_delay(), Some(300));
        assert_eq!(handler.sample_avg_delay(), None);
        assert_eq!(handler.avg_delay_persistence_ms(), 300);

        assert_eq!(handler.partitions_with_stats(), vec![0, 1]);
        let bases = handler.base_acks_for_partition(0).unwrap();
        assert_eq!(bases.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(bases[&0].is_acked(1));
        assert!(bases[&1].is_acked(ACK_WINDOW_SIZE + 5));
        assert!(!bases[&1].is_acked(ACK_WINDOW_SIZE + 6));

        handler.prune_acknowledged(0, 0);
        let bases = handler.base_acks_for_partition(0).unwrap();
        assert_eq!(bases.len(), 1);
        handler.prune_acknowledged(1, 0);
        assert_eq!(handler.partitions_with_stats(), vec![0]);
    }

    /// 没有确认回复时，每个分区的窗口数有上限，最旧的窗口先被丢弃。
    #[test]
    fn test_unacknowledged_windows_are_bounded() {
        let mut handler = StorageFrameHandler::default();
        let extra = 3u64;
        for base in 0..MAX_TRACKED_WINDOWS_PER_PARTITION as u64 + extra {
            let t = tuple(0, base * ACK_WINDOW_SIZE, 0);
            let frame = frame_from_tuples(128, vec![&t[..]]).unwrap();
            handler.update_tracking_information(&frame, 10).unwrap();
        }
        let bases = handler.base_acks_for_partition(0).unwrap();
        assert_eq!(bases.len(), MAX_TRACKED_WINDOWS_PER_PARTITION);
        assert_eq!(bases.keys().next().copied(), Some(extra));

        handler.clear();
        assert!(handler.partitions_with_stats().is_empty());
        assert_eq!(handler.sample_avg_delay(), None);
    }

    #[test]
    fn test_ack_bitmap_counts_each_record_once() {
        let mut stats = IntakePartitionStatistics::new(0, 0);
        stats.ack_record(9);
        stats.ack_record(9);
        stats.ack_record(ACK_WINDOW_SIZE); // 属于下一个窗口
        assert_eq!(stats.acked_count(), 1);
        assert_eq!(stats.ack_info().len(), ACK_WINDOW_SIZE as usize / 8);
        assert_eq!(stats.ack_info()[1], 0b10);
    }
}
