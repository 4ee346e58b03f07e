//! 数据 bucket 与缓冲池。
//!
//! 一个 `DataBucket` 包装一帧 (`Bytes`)，被所有收集器共享读取。
//! 每个收集器读完后调用一次 `done_reading`，读取计数达到期望值时，
//! bucket 占用的池槽位 (slot) 归还给 `DataBucketPool`，恰好一次。
//!
//! 控制标记 (EOD / EOSD) 使用不占池容量的独立 bucket。

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{trace, warn};

/// bucket 携带的内容类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// 一帧数据。
    Data,
    /// 数据结束标记 (end of data)。
    Eod,
    /// 溢出数据回放结束标记 (end of spilled data)。
    Eosd,
}

/// 池内共享状态：空闲槽位列表与等待者通知。
struct PoolShared {
    capacity: usize,
    free_slots: Mutex<Vec<usize>>,
    slot_freed: Notify,
}

impl PoolShared {
    fn take_slot(&self) -> Option<usize> {
        match self.free_slots.lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }

    fn return_slot(&self, slot: usize) {
        match self.free_slots.lock() {
            Ok(mut free) => free.push(slot),
            Err(poisoned) => poisoned.into_inner().push(slot),
        }
        self.slot_freed.notify_waiters();
    }

    fn available(&self) -> usize {
        match self.free_slots.lock() {
            Ok(free) => free.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// 被多个收集器共享读取的一帧。
pub struct DataBucket {
    /// 所占用的池槽位；控制标记为 `None`。
    slot: Option<(usize, Arc<PoolShared>)>,
    content: Bytes,
    content_type: ContentType,
    desired_read_count: usize,
    read_count: AtomicUsize,
}

impl fmt::Debug for DataBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBucket")
            .field("slot", &self.slot.as_ref().map(|(slot, _)| *slot))
            .field("content_type", &self.content_type)
            .field("len", &self.content.len())
            .field("desired_read_count", &self.desired_read_count)
            .field("read_count", &self.read_count.load(Ordering::Acquire))
            .finish()
    }
}

impl DataBucket {
    /// 创建一个不占用池容量的控制标记 bucket。
    pub fn marker(content_type: ContentType, desired_read_count: usize) -> Arc<Self> {
        Arc::new(Self {
            slot: None,
            content: Bytes::new(),
            content_type,
            desired_read_count: desired_read_count.max(1),
            read_count: AtomicUsize::new(0),
        })
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn desired_read_count(&self) -> usize {
        self.desired_read_count
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::Acquire)
    }

    /// 是否占用池槽位。
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    /// 某个读者读完了这个 bucket。
    ///
    /// 第 `desired_read_count` 次调用把槽位归还给池；多余的调用被忽略。
    /// 返回本次调用是否触发了归还 (或标记的最后一次读取)。
    pub fn done_reading(&self) -> bool {
        let desired = self.desired_read_count;
        let updated = self
            .read_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count < desired {
                    Some(count + 1)
                } else {
                    None
                }
            });
        match updated {
            Ok(previous) if previous + 1 == desired => {
                if let Some((slot, pool)) = &self.slot {
                    trace!("(DataBucket) 槽位 {} 读取完毕，归还给缓冲池", slot);
                    pool.return_slot(*slot);
                }
                true
            }
            Ok(_) => false,
            Err(count) => {
                warn!(
                    "(DataBucket) 多余的 done_reading 调用被忽略 (已读 {} / 期望 {})",
                    count, desired
                );
                false
            }
        }
    }
}

/// 固定容量的 bucket 池。克隆成本很低，克隆体共享同一组槽位。
#[derive(Clone)]
pub struct DataBucketPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for DataBucketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBucketPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl DataBucketPool {
    /// 容量至少为 1，`acquire` 因此总能在读者归还后拿到槽位。
    pub fn new(capacity: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                free_slots: Mutex::new((0..capacity).rev().collect()),
                slot_freed: Notify::new(),
            }),
        }
    }

    /// 非阻塞地分配一个装载 `frame` 的 bucket。池耗尽时返回 `None`。
    pub fn get_data_bucket(&self, frame: Bytes, desired_read_count: usize) -> Option<Arc<DataBucket>> {
        let slot = self.shared.take_slot()?;
        Some(Arc::new(DataBucket {
            slot: Some((slot, Arc::clone(&self.shared))),
            content: frame,
            content_type: ContentType::Data,
            desired_read_count: desired_read_count.max(1),
            read_count: AtomicUsize::new(0),
        }))
    }

    /// 等待直到有空闲槽位再分配。只在关闭时的排空路径上使用。
    pub async fn acquire(&self, frame: Bytes, desired_read_count: usize) -> Arc<DataBucket> {
        loop {
            // 先注册等待再检查，避免错过检查与等待之间的归还通知
            let freed = self.shared.slot_freed.notified();
            if let Some(bucket) = self.get_data_bucket(frame.clone(), desired_read_count) {
                return bucket;
            }
            freed.await;
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn available(&self) -> usize {
        self.shared.available()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }

    /// 两个句柄是否指向同一个池。
    pub fn same_pool(&self, other: &DataBucketPool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// 收集器工作任务持有的读取凭证。
///
/// Drop 时如果还没有调用过 `finish`，会自动调用 `done_reading`，
/// 保证任何错误路径上都不会泄漏池槽位。
#[derive(Debug)]
pub struct BucketReader {
    bucket: Arc<DataBucket>,
    done: bool,
}

impl BucketReader {
    pub fn new(bucket: Arc<DataBucket>) -> Self {
        Self {
            bucket,
            done: false,
        }
    }

    pub fn bucket(&self) -> &Arc<DataBucket> {
        &self.bucket
    }

    /// 显式结束读取。
    pub fn finish(mut self) {
        self.done = true;
        self.bucket.done_reading();
    }
}

impl Drop for BucketReader {
    fn drop(&mut self) {
        if !self.done {
            self.bucket.done_reading();
        }
    }
}

/// 向分发器发放缓冲池并回收。
///
/// 每个分发器在第一次需要缓冲时获取一个池，不再需要时归还。
/// 获取与归还次数可供观测。
#[derive(Debug, Clone)]
pub struct FeedMemoryManager {
    inner: Arc<MemoryManagerInner>,
}

#[derive(Debug)]
struct MemoryManagerInner {
    pool_capacity: NonZeroUsize,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
}

impl FeedMemoryManager {
    pub fn new(pool_capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(MemoryManagerInner {
                pool_capacity,
                acquisitions: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }),
        }
    }

    pub fn acquire_pool(&self) -> DataBucketPool {
        self.inner.acquisitions.fetch_add(1, Ordering::AcqRel);
        DataBucketPool::new(self.inner.pool_capacity)
    }

    pub fn release_pool(&self, pool: DataBucketPool) {
        self.inner.releases.fetch_add(1, Ordering::AcqRel);
        if pool.in_use() > 0 {
            // 仍在被读取的 bucket 持有共享状态，槽位稍后照常归还
            warn!(
                "(MemoryManager) 归还的缓冲池仍有 {} 个 bucket 未读完",
                pool.in_use()
            );
        }
    }

    pub fn pool_capacity(&self) -> usize {
        self.inner.pool_capacity.get()
    }

    pub fn acquisitions(&self) -> usize {
        self.inner.acquisitions.load(Ordering::Acquire)
    }

    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::Acquire)
    }

    /// 当前尚未归还的池数量。
    pub fn outstanding(&self) -> usize {
        self.acquisitions().saturating_sub(self.releases())
    }
}
