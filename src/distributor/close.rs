//! 数据流结束、关闭排空与状态快照。

use super::FrameDistributor;
use crate::error::DistributorError;
use crate::types::{CollectorState, DistributionMode, DistributorStatus, RoutingMode};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

impl FrameDistributor {
    /// 数据流结束：先回放溢出日志，再让每个收集器在已入队的帧之后结束。
    pub(super) async fn notify_end_of_feed(&mut self) {
        info!(
            "(Distributor {}) 数据流结束，通知 {} 个收集器",
            self.key,
            self.collectors.len()
        );
        if let Err(e) = self.drain_spill_blocking().await {
            error!("(Distributor {}) 结束前回放溢出日志失败: {}", self.key, e);
        }
        for collector in self.collectors.values() {
            collector.close_collector().await;
        }
    }

    /// 关闭：排空所有收集器，归还缓冲池，删除溢出文件。
    /// 返回的快照中分发模式为 INACTIVE，收集器列表为它们排空之后的最终状态。
    pub(super) async fn close_internal(&mut self) -> Result<DistributorStatus, DistributorError> {
        for summary in self.handlers.summaries() {
            info!("(Distributor {}) {}", self.key, summary);
        }

        let direct_single = self.distribution_mode == DistributionMode::Single
            && self.config.short_circuit
            && self.handlers.spill.pending() == 0
            && self
                .collectors
                .values()
                .all(|c| c.state() == CollectorState::Active && !c.has_worker());

        let mut drain_result = Ok(());
        if direct_single {
            // 短路中的唯一收集器没有积压，直接断开写入端
            for collector in self.collectors.values() {
                collector.close_collector().await;
            }
        } else if self.distribution_mode != DistributionMode::Inactive {
            drain_result = self.drain_spill_blocking().await;
            for collector in self.collectors.values() {
                collector.close_collector().await;
            }
            self.wait_collectors_finished().await;
            for collector in self.collectors.values() {
                collector.disconnect().await;
            }
        }

        self.release_pool();
        if let Err(e) = self.handlers.spill.close().await {
            warn!("(Distributor {}) 删除溢出日志失败: {}", self.key, e);
        }

        let mut status = self.status();
        self.collectors.clear();
        self.distribution_mode = DistributionMode::Inactive;
        self.routing_mode = RoutingMode::InMemoryRoute;
        self.check_mode_invariant();
        status.distribution_mode = Some(self.distribution_mode);
        status.routing_mode = Some(self.routing_mode);
        status.pool_capacity = None;
        status.pool_available = None;
        info!("(Distributor {}) 已关闭", self.key);
        drain_result.map(|()| status)
    }

    /// 并发等待每个收集器进入 FINISHED，每隔一段时间记录仍在等待的收集器。
    async fn wait_collectors_finished(&self) {
        let interval = self.config.drain_log_interval;
        let key = &self.key;
        let waits = self.collectors.values().map(|collector| async move {
            while tokio::time::timeout(interval, collector.wait_finished())
                .await
                .is_err()
            {
                warn!(
                    "(Distributor {}) 仍在等待收集器 {} 排空 (积压 {})",
                    key,
                    collector.writer_id(),
                    collector.pending_work()
                );
            }
            debug!(
                "(Distributor {}) 收集器 {} 已结束",
                key,
                collector.writer_id()
            );
        });
        join_all(waits).await;
    }

    pub(super) fn status(&self) -> DistributorStatus {
        let mut collectors: Vec<_> = self.collectors.values().map(|c| c.status()).collect();
        collectors.sort_by(|a, b| a.writer_id.cmp(&b.writer_id));
        DistributorStatus {
            distribution_mode: Some(self.distribution_mode),
            routing_mode: Some(self.routing_mode),
            collectors,
            pool_capacity: self.pool.as_ref().map(|p| p.capacity()),
            pool_available: self.pool.as_ref().map(|p| p.available()),
            in_memory_frames: self.handlers.in_memory.frames(),
            short_circuit_frames: self.short_circuit_frames,
            spilled_frames: self.handlers.spill.spilled_total(),
            replayed_frames: self.handlers.spill.replayed_total(),
            discarded_frames: self.handlers.discard.frames(),
            pending_spilled_frames: self.handlers.spill.pending(),
            summaries: self.handlers.summaries(),
        }
    }
}
