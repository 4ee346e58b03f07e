//! 帧分发器 actor 的主模块定义和核心事件循环
//!
//! 包含 `FrameDistributor` 结构体定义、启动函数 (`spawn`)、主事件循环 (`run`)
//! 以及请求分发逻辑 (`handle_request`)。
//! 拓扑变更、帧路由和关闭排空的具体逻辑分别放在子模块中。
//!
//! 所有请求都在 actor 任务中串行处理，这就是每个分发器唯一的一把“粗粒度锁”：
//! 同一时刻只有一个操作在读写分发器状态。

mod close;
mod routing;
mod topology;

use crate::bucket::{DataBucketPool, FeedMemoryManager};
use crate::collector::FrameCollector;
use crate::config::FeedConfig;
use crate::error::DistributorError;
use crate::handle::DistributorHandle;
use crate::handlers::FrameHandlers;
use crate::types::{DistributionMode, FeedRuntimeKey, Request, RoutingMode, WriterId};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

/// 帧分发器 actor。每个 (feed, 运行时类型, 分区) 至多一个。
pub struct FrameDistributor {
    key: FeedRuntimeKey,
    config: FeedConfig,
    memory_manager: FeedMemoryManager,
    /// 接收来自 Handle 的请求的 MPSC 通道接收端
    request_rx: mpsc::Receiver<Request>,
    /// 已注册的收集器 (writer → collector)。
    collectors: HashMap<WriterId, FrameCollector>,
    distribution_mode: DistributionMode,
    routing_mode: RoutingMode,
    /// 当前持有的缓冲池；只在需要缓冲时持有。
    pool: Option<DataBucketPool>,
    handlers: FrameHandlers,
    /// 是否有任一收集器的策略允许拥塞时溢出到磁盘。
    spill_required: bool,
    short_circuit_frames: u64,
}

impl FrameDistributor {
    /// 启动分发器 actor 任务，返回与之交互的 Handle。
    pub fn spawn(
        key: FeedRuntimeKey,
        config: FeedConfig,
        memory_manager: FeedMemoryManager,
    ) -> DistributorHandle {
        let chan_size = config.request_channel_size.get();
        let (request_tx, request_rx) = mpsc::channel(chan_size);
        let spill_path = config.spill_dir.join(format!(
            "{}_{}_{}.spill",
            key.feed_id, key.runtime_type, key.partition
        ));
        let handlers = FrameHandlers::new(spill_path, config.frame_size);
        let distributor = FrameDistributor {
            key: key.clone(),
            config,
            memory_manager,
            request_rx,
            collectors: HashMap::new(),
            distribution_mode: DistributionMode::Inactive,
            routing_mode: RoutingMode::InMemoryRoute,
            pool: None,
            handlers,
            spill_required: false,
            short_circuit_frames: 0,
        };

        let handle = DistributorHandle::new(request_tx, key.clone());
        tokio::spawn(distributor.run());
        info!(
            "(Distributor {}) 任务已启动。请求通道容量: {}",
            key, chan_size
        );
        handle
    }

    /// 分发器的主事件循环
    async fn run(mut self) {
        info!("(Distributor {}) 事件循环开始。", self.key);
        let mut closed = false;
        while let Some(request) = self.request_rx.recv().await {
            trace!("(Distributor {}) 收到请求: {:?}", self.key, request);
            if !self.handle_request(request).await {
                info!("(Distributor {}) 已关闭，停止事件循环。", self.key);
                closed = true;
                break;
            }
        }
        if !closed {
            // 所有 Handle 都已 Drop，按关闭流程排空
            info!("(Distributor {}) 请求通道已关闭 (Handle 可能已 Drop)，开始排空关闭...", self.key);
            if let Err(e) = self.close_internal().await {
                error!("(Distributor {}) 排空关闭失败: {}", self.key, e);
            }
        }

        // 关闭后仍在通道中排队的请求统一回复 Closed
        self.request_rx.close();
        while let Ok(request) = self.request_rx.try_recv() {
            self.reject_closed(request);
        }
        info!("(Distributor {}) 任务退出。", self.key);
    }

    /// 处理单个请求。返回 `true` 继续运行，`false` 停止事件循环。
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Register {
                collector,
                reply_tx,
            } => {
                let result = self.register_frame_collector(collector).await;
                let _ = reply_tx.send(result);
            }
            Request::Deregister {
                writer_id,
                reply_tx,
            } => {
                let result = self.deregister_frame_collector(&writer_id).await;
                let _ = reply_tx.send(result);
            }
            Request::NextFrame { frame, reply_tx } => {
                let result = self.next_frame(frame).await;
                let _ = reply_tx.send(result);
            }
            Request::EndOfFeed { reply_tx } => {
                self.notify_end_of_feed().await;
                let _ = reply_tx.send(());
            }
            Request::IsRegistered {
                writer_id,
                reply_tx,
            } => {
                let _ = reply_tx.send(self.collectors.contains_key(&writer_id));
            }
            Request::Status { reply_tx } => {
                let _ = reply_tx.send(self.status());
            }
            Request::SetPartitions {
                partitions,
                reply_tx,
            } => {
                for collector in self.collectors.values() {
                    collector.set_number_of_partitions(partitions).await;
                }
                let _ = reply_tx.send(());
            }
            Request::CommitAckResponse {
                intake_partition,
                max_window_acked,
                reply_tx,
            } => {
                for collector in self.collectors.values() {
                    collector
                        .receive_commit_ack_response(intake_partition, max_window_acked)
                        .await;
                }
                let _ = reply_tx.send(());
            }
            Request::Close { reply_tx } => {
                info!("(Distributor {}) 收到 Close 请求，开始排空...", self.key);
                let result = self.close_internal().await;
                if reply_tx.send(result).is_err() {
                    warn!("(Distributor {}) 发送 Close 结果失败 (调用者已放弃等待)", self.key);
                }
                // Close 是终止信号
                return false;
            }
        }
        true
    }

    fn reject_closed(&self, request: Request) {
        match request {
            Request::Register { reply_tx, .. } | Request::Deregister { reply_tx, .. } => {
                let _ = reply_tx.send(Err(DistributorError::Closed));
            }
            Request::NextFrame { reply_tx, .. } => {
                let _ = reply_tx.send(Err(DistributorError::Closed));
            }
            Request::Close { reply_tx } => {
                let _ = reply_tx.send(Err(DistributorError::Closed));
            }
            Request::IsRegistered { reply_tx, .. } => {
                let _ = reply_tx.send(false);
            }
            Request::Status { reply_tx } => {
                let _ = reply_tx.send(self.status());
            }
            Request::EndOfFeed { reply_tx }
            | Request::SetPartitions { reply_tx, .. }
            | Request::CommitAckResponse { reply_tx, .. } => {
                let _ = reply_tx.send(());
            }
        }
    }

    /// 确保持有缓冲池，返回它的一个句柄。
    fn ensure_pool(&mut self) -> DataBucketPool {
        match &self.pool {
            Some(pool) => pool.clone(),
            None => {
                let pool = self.memory_manager.acquire_pool();
                info!(
                    "(Distributor {}) 获取缓冲池 (容量 {})",
                    self.key,
                    pool.capacity()
                );
                self.pool = Some(pool.clone());
                pool
            }
        }
    }

    fn release_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            info!("(Distributor {}) 归还缓冲池", self.key);
            self.memory_manager.release_pool(pool);
        }
    }

    /// 校验分发模式与收集器数量一致。
    fn check_mode_invariant(&self) {
        let expected = DistributionMode::for_collector_count(self.collectors.len());
        if self.distribution_mode != expected {
            error!(
                "(Distributor {}) 分发模式 {} 与收集器数量 {} 不一致",
                self.key,
                self.distribution_mode,
                self.collectors.len()
            );
        }
        debug_assert_eq!(self.distribution_mode, expected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedPolicyAccessor;
    use crate::context::FeedContext;
    use crate::frame::frame_from_tuples;
    use crate::types::{FeedConnectionId, FeedId, FeedRuntimeId, FeedRuntimeType};
    use crate::writer::RecordingWriter;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    /// 所有 Handle 被 Drop 后，分发器按关闭流程排空：已收到的帧全部交付，写入端被关闭，缓冲池归还。
    #[tokio::test]
    async fn test_dropping_every_handle_drains_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let config = FeedConfig::default()
            .with_frame_size(64)
            .with_spill_dir(dir.path());
        let (context, _messages) = FeedContext::new(config.clone());
        let manager = FeedMemoryManager::new(NonZeroUsize::new(4).unwrap());
        let key = FeedRuntimeKey::new(FeedId::new("dv", "tweets"), FeedRuntimeType::Intake, 0);
        let handle = FrameDistributor::spawn(key, config, manager.clone());

        let connection = FeedConnectionId::new(FeedId::new("dv", "tweets"), "sink");
        let mut logs = Vec::new();
        for i in 0..2 {
            let (writer, log) = RecordingWriter::new(format!("w{}", i));
            let monitor = context.monitor_context(FeedRuntimeId::new(
                FeedRuntimeType::Compute,
                connection.clone(),
                i,
            ));
            let collector = FrameCollector::new(
                format!("w{}", i),
                Box::new(writer),
                FeedPolicyAccessor::default(),
                monitor,
            );
            handle.register(collector).await.unwrap();
            logs.push(log);
        }
        for _ in 0..3 {
            let frame = frame_from_tuples(64, vec![&b"tuple"[..]]).unwrap();
            handle.next_frame(frame).await.unwrap();
        }
        drop(handle);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !logs.iter().all(|log| log.is_closed()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Handle 全部 Drop 后写入端应被关闭 (Writers should close once every handle is dropped)");
        for log in &logs {
            assert_eq!(log.frame_count(), 3);
            assert_eq!(log.close_count(), 1);
        }
        assert_eq!(manager.outstanding(), 0);
    }
}
