//! 元组级错误的恢复：记录出错元组，切掉它及其之前的元组后重试剩余部分。

use crate::error::FeedError;
use crate::frame::{slice_frame, FrameTupleAccessor};
use crate::types::FeedConnectionId;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// 元组预览的最大字节数。
const TUPLE_PREVIEW_LIMIT: usize = 64;

/// 转发失败时决定是否以及如何继续。
pub trait ExceptionHandler: Send + Sync {
    /// 返回替代帧以便重试；返回 `None` 表示该帧的失败无法恢复。
    fn handle_exception(&self, error: &FeedError, frame: &Bytes) -> Option<Bytes>;
}

/// 默认的异常处理器：只恢复 `FeedError::FrameData`。
#[derive(Debug)]
pub struct FeedExceptionHandler {
    connection_id: FeedConnectionId,
    logged_tuples: AtomicU64,
}

impl FeedExceptionHandler {
    pub fn new(connection_id: FeedConnectionId) -> Self {
        Self {
            connection_id,
            logged_tuples: AtomicU64::new(0),
        }
    }

    /// 已记录 (并跳过) 的出错元组数。
    pub fn logged_tuples(&self) -> u64 {
        self.logged_tuples.load(Ordering::Acquire)
    }

    fn log_offending_tuple(&self, accessor: &FrameTupleAccessor<'_>, tuple_index: usize, message: &str) {
        let preview = accessor
            .tuple(tuple_index)
            .map(|t| String::from_utf8_lossy(&t[..t.len().min(TUPLE_PREVIEW_LIMIT)]).into_owned())
            .unwrap_or_default();
        warn!(
            "(ExceptionHandler {}) 跳过出错元组 #{}: '{}' ({})",
            self.connection_id, tuple_index, preview, message
        );
        self.logged_tuples.fetch_add(1, Ordering::AcqRel);
    }
}

impl ExceptionHandler for FeedExceptionHandler {
    fn handle_exception(&self, error: &FeedError, frame: &Bytes) -> Option<Bytes> {
        let (tuple_index, message) = match error {
            FeedError::FrameData {
                tuple_index,
                message,
            } => (*tuple_index, message.as_str()),
            _ => return None,
        };
        let accessor = match FrameTupleAccessor::new(frame) {
            Ok(accessor) => accessor,
            Err(e) => {
                warn!(
                    "(ExceptionHandler {}) 无法解析出错帧，放弃恢复: {}",
                    self.connection_id, e
                );
                return None;
            }
        };
        if tuple_index >= accessor.tuple_count() {
            warn!(
                "(ExceptionHandler {}) 出错元组下标 {} 超出帧内元组数 {}",
                self.connection_id,
                tuple_index,
                accessor.tuple_count()
            );
            return None;
        }
        self.log_offending_tuple(&accessor, tuple_index, message);
        slice_frame(frame, tuple_index + 1).ok()
    }
}
