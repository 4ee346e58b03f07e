//! 固定大小帧 (frame) 的元组布局编解码。
//!
//! 一帧恰好 `frame_size` 字节，布局（大端序）：
//! - 最后 4 字节：元组数量 `n` (u32)；
//! - 其前 `4 * n` 字节：各元组的结束偏移，第 `i` 个元组的结束偏移存放在
//!   `frame_size - 4 - 4 * (i + 1)` 处；
//! - 元组数据从偏移 0 开始紧凑排列，第 `i` 个元组占据 `[end(i-1), end(i))`，`end(-1) = 0`。
//!
//! 帧内容在分发过程中被视为不可变，因此这里只提供只读访问器 (`FrameTupleAccessor`)
//! 和用于构造新帧的追加器 (`FrameTupleAppender`)。

use crate::error::FeedError;
use bytes::{BufMut, Bytes, BytesMut};

/// 帧尾部元组数量字段的大小。
const TUPLE_COUNT_SIZE: usize = 4;
/// 每个元组结束偏移槽位的大小。
const SLOT_SIZE: usize = 4;

fn read_u32(buf: &[u8], at: usize) -> usize {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw) as usize
}

/// 帧的只读元组访问器。构造时会完整校验偏移索引。
#[derive(Debug, Clone, Copy)]
pub struct FrameTupleAccessor<'a> {
    frame: &'a [u8],
    tuple_count: usize,
}

impl<'a> FrameTupleAccessor<'a> {
    /// 在给定帧上创建访问器。
    ///
    /// # Errors
    /// 帧太短、元组数量越界或偏移不单调时返回 `FeedError::MalformedFrame`。
    pub fn new(frame: &'a [u8]) -> Result<Self, FeedError> {
        let len = frame.len();
        if len < TUPLE_COUNT_SIZE {
            return Err(FeedError::MalformedFrame(format!(
                "帧长度 {} 小于元组计数字段大小",
                len
            )));
        }
        let tuple_count = read_u32(frame, len - TUPLE_COUNT_SIZE);
        let index_size = tuple_count
            .checked_mul(SLOT_SIZE)
            .and_then(|s| s.checked_add(TUPLE_COUNT_SIZE))
            .filter(|total| *total <= len)
            .ok_or_else(|| {
                FeedError::MalformedFrame(format!(
                    "元组数量 {} 超出帧容量 {}",
                    tuple_count, len
                ))
            })?;
        let data_limit = len - index_size;

        let accessor = Self { frame, tuple_count };
        let mut previous_end = 0;
        for i in 0..tuple_count {
            let end = accessor.tuple_end_offset(i);
            if end < previous_end || end > data_limit {
                return Err(FeedError::MalformedFrame(format!(
                    "第 {} 个元组的结束偏移 {} 不合法 (前一个结束于 {}, 数据区上限 {})",
                    i, end, previous_end, data_limit
                )));
            }
            previous_end = end;
        }
        Ok(accessor)
    }

    /// 帧中的元组数量。
    pub fn tuple_count(&self) -> usize {
        self.tuple_count
    }

    /// 帧的总字节数。
    pub fn frame_size(&self) -> usize {
        self.frame.len()
    }

    /// 第 `index` 个元组的起始偏移。
    pub fn tuple_start_offset(&self, index: usize) -> usize {
        if index == 0 {
            0
        } else {
            self.tuple_end_offset(index - 1)
        }
    }

    /// 第 `index` 个元组的结束偏移（不含）。
    pub fn tuple_end_offset(&self, index: usize) -> usize {
        let slot = self.frame.len() - TUPLE_COUNT_SIZE - SLOT_SIZE * (index + 1);
        read_u32(self.frame, slot)
    }

    /// 第 `index` 个元组的内容；下标越界时返回 `None`。
    pub fn tuple(&self, index: usize) -> Option<&'a [u8]> {
        if index >= self.tuple_count {
            return None;
        }
        let start = self.tuple_start_offset(index);
        let end = self.tuple_end_offset(index);
        Some(&self.frame[start..end])
    }

    /// 按顺序遍历所有元组。
    pub fn tuples(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.tuple_count).filter_map(move |i| self.tuple(i))
    }
}

/// 帧构造器：向一个容量为 `frame_size` 的新帧中追加元组。
#[derive(Debug, Clone)]
pub struct FrameTupleAppender {
    frame_size: usize,
    data: Vec<u8>,
    ends: Vec<u32>,
}

impl FrameTupleAppender {
    /// # Errors
    /// `frame_size` 连元组计数字段都放不下时返回 `FeedError::MalformedFrame`。
    pub fn new(frame_size: usize) -> Result<Self, FeedError> {
        if frame_size < TUPLE_COUNT_SIZE {
            return Err(FeedError::MalformedFrame(format!(
                "帧大小 {} 小于元组计数字段大小 {}",
                frame_size, TUPLE_COUNT_SIZE
            )));
        }
        Ok(Self {
            frame_size,
            data: Vec::new(),
            ends: Vec::new(),
        })
    }

    /// 追加一个元组。帧剩余空间不足以容纳数据和新槽位时返回 `false`，帧内容不变。
    pub fn append(&mut self, tuple: &[u8]) -> bool {
        let needed = self.data.len()
            + tuple.len()
            + SLOT_SIZE * (self.ends.len() + 1)
            + TUPLE_COUNT_SIZE;
        if needed > self.frame_size {
            return false;
        }
        self.data.extend_from_slice(tuple);
        self.ends.push(self.data.len() as u32);
        true
    }

    /// 从另一帧复制第 `index` 个元组。
    pub fn append_from(&mut self, accessor: &FrameTupleAccessor<'_>, index: usize) -> bool {
        match accessor.tuple(index) {
            Some(tuple) => self.append(tuple),
            None => false,
        }
    }

    pub fn tuple_count(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    /// 清空已追加的元组，复用构造器。
    pub fn reset(&mut self) {
        self.data.clear();
        self.ends.clear();
    }

    /// 生成恰好 `frame_size` 字节的帧。
    pub fn build(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_size);
        buf.put_slice(&self.data);
        let index_size = SLOT_SIZE * self.ends.len() + TUPLE_COUNT_SIZE;
        // append 保证数据与索引不超过 frame_size
        let padding = self
            .frame_size
            .saturating_sub(self.data.len() + index_size);
        buf.put_bytes(0, padding);
        // 结束偏移槽位从帧尾向前排列，因此按逆序写入
        for end in self.ends.iter().rev() {
            buf.put_u32(*end);
        }
        buf.put_u32(self.ends.len() as u32);
        buf.freeze()
    }
}

/// 构造一个只包含第 `start_tuple` 个及之后元组的新帧。
/// `start_tuple` 不小于元组数量时得到一个空帧。
pub fn slice_frame(frame: &[u8], start_tuple: usize) -> Result<Bytes, FeedError> {
    let accessor = FrameTupleAccessor::new(frame)?;
    let mut appender = FrameTupleAppender::new(frame.len())?;
    for i in start_tuple..accessor.tuple_count() {
        // 源帧能装下的元组，在同样大小、更少元组的新帧中一定也装得下
        appender.append_from(&accessor, i);
    }
    Ok(appender.build())
}

/// 读取帧中的元组数量，帧格式不合法时返回 0。
/// 用于速率统计，统计路径上的格式错误不应影响转发。
pub fn tuple_count_lossy(frame: &[u8]) -> usize {
    FrameTupleAccessor::new(frame)
        .map(|a| a.tuple_count())
        .unwrap_or(0)
}

/// 按给定元组列表构造一帧，放不下的元组会被忽略。测试与示例中常用。
pub fn frame_from_tuples<'t, I>(frame_size: usize, tuples: I) -> Result<Bytes, FeedError>
where
    I: IntoIterator<Item = &'t [u8]>,
{
    let mut appender = FrameTupleAppender::new(frame_size)?;
    for tuple in tuples {
        if !appender.append(tuple) {
            break;
        }
    }
    Ok(appender.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appender_and_accessor_agree() {
        let mut appender = FrameTupleAppender::new(64).unwrap();
        assert!(appender.append(b"alpha"));
        assert!(appender.append(b""));
        assert!(appender.append(b"gamma!"));
        let frame = appender.build();
        assert_eq!(frame.len(), 64);

        let accessor = FrameTupleAccessor::new(&frame).unwrap();
        assert_eq!(accessor.tuple_count(), 3);
        assert_eq!(accessor.tuple(0), Some(&b"alpha"[..]));
        assert_eq!(accessor.tuple(1), Some(&b""[..]));
        assert_eq!(accessor.tuple(2), Some(&b"gamma!"[..]));
        assert_eq!(accessor.tuple(3), None);
        assert_eq!(accessor.tuple_start_offset(2), 5);
        let collected: Vec<&[u8]> = accessor.tuples().collect();
        assert_eq!(collected.len(), 3);
    }

    /// 帧满时追加失败且不改变已有内容。
    #[test]
    fn test_appender_rejects_when_full() {
        // 16 字节：4 字节计数 + 每个元组 4 字节槽位
        let mut appender = FrameTupleAppender::new(16).unwrap();
        assert!(appender.append(b"1234")); // 4 + 4 + 4 = 12
        assert!(!appender.append(b"5")); // 5 + 8 + 4 = 17 > 16
        assert_eq!(appender.tuple_count(), 1);
        let frame = appender.build();
        assert_eq!(tuple_count_lossy(&frame), 1);
    }

    #[test]
    fn test_empty_frame_has_zero_tuples() {
        let frame = FrameTupleAppender::new(32).unwrap().build();
        assert_eq!(frame.len(), 32);
        assert_eq!(FrameTupleAccessor::new(&frame).unwrap().tuple_count(), 0);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(FrameTupleAccessor::new(&[0u8, 1]).is_err());

        // 元组数量声明为 100，但帧只有 16 字节
        let mut bad = vec![0u8; 16];
        bad[12..16].copy_from_slice(&100u32.to_be_bytes());
        assert!(FrameTupleAccessor::new(&bad).is_err());
        assert_eq!(tuple_count_lossy(&bad), 0);

        // 结束偏移超出数据区
        let mut bad = vec![0u8; 16];
        bad[12..16].copy_from_slice(&1u32.to_be_bytes());
        bad[8..12].copy_from_slice(&15u32.to_be_bytes());
        assert!(FrameTupleAccessor::new(&bad).is_err());
    }

    #[test]
    fn test_slice_frame_drops_leading_tuples() {
        let tuples: Vec<&[u8]> = vec![b"t0", b"t1", b"t2", b"t3"];
        let frame = frame_from_tuples(128, tuples).unwrap();
        let sliced = slice_frame(&frame, 2).unwrap();
        assert_eq!(sliced.len(), 128);
        let accessor = FrameTupleAccessor::new(&sliced).unwrap();
        assert_eq!(accessor.tuple_count(), 2);
        assert_eq!(accessor.tuple(0), Some(&b"t2"[..]));
        assert_eq!(accessor.tuple(1), Some(&b"t3"[..]));

        let empty = slice_frame(&frame, 4).unwrap();
        assert_eq!(tuple_count_lossy(&empty), 0);
    }

    /// 帧大小小于计数字段时拒绝构造，而不是在 build 时溢出。
    #[test]
    fn test_frame_size_smaller_than_count_field_is_rejected() {
        assert!(matches!(
            frame_from_tuples(2, Vec::<&[u8]>::new()),
            Err(FeedError::MalformedFrame(_))
        ));
        assert!(FrameTupleAppender::new(0).is_err());
        // 恰好只能放下计数字段的帧是合法的空帧
        let minimal = frame_from_tuples(4, vec![&b"x"[..]]).unwrap();
        assert_eq!(minimal.len(), 4);
        assert_eq!(tuple_count_lossy(&minimal), 0);
    }
}
