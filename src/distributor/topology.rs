//! 拓扑变更：注册与注销帧收集器，维护分发模式与缓冲池的持有。

use super::FrameDistributor;
use crate::collector::FrameCollector;
use crate::error::DistributorError;
use crate::types::{CollectorState, DistributionMode, RoutingMode};
use tracing::{info, warn};

impl FrameDistributor {
    /// 注册一个收集器。先打开它的写入端，成功后才加入分发集合。
    pub(super) async fn register_frame_collector(
        &mut self,
        mut collector: FrameCollector,
    ) -> Result<DistributionMode, DistributorError> {
        let writer_id = collector.writer_id().clone();
        if self.collectors.contains_key(&writer_id) {
            warn!(
                "(Distributor {}) 写入端 {} 已注册，拒绝重复注册",
                self.key, writer_id
            );
            return Err(DistributorError::AlreadyRegistered(writer_id));
        }

        collector
            .open()
            .await
            .map_err(|e| DistributorError::WriterOpenFailed {
                writer_id: writer_id.clone(),
                message: e.to_string(),
            })?;

        match self.distribution_mode {
            DistributionMode::Inactive => {
                // 单个订阅者且允许短路时不需要缓冲池，也不需要工作任务
                if !self.config.short_circuit {
                    self.ensure_pool();
                    collector.start();
                }
            }
            DistributionMode::Single | DistributionMode::Shared => {
                self.ensure_pool();
                // 之前短路的唯一收集器此后也要经由收件箱接收
                for existing in self.collectors.values_mut() {
                    existing.start();
                }
                collector.start();
            }
        }

        self.collectors.insert(writer_id.clone(), collector);
        self.distribution_mode = DistributionMode::for_collector_count(self.collectors.len());
        self.refresh_spill_required();
        self.check_mode_invariant();
        info!(
            "(Distributor {}) 注册写入端 {}，当前 {} 个收集器，模式 {}",
            self.key,
            writer_id,
            self.collectors.len(),
            self.distribution_mode
        );
        Ok(self.distribution_mode)
    }

    /// 注销一个收集器。它的工作任务会继续处理已入队的帧，然后关闭写入端。
    pub(super) async fn deregister_frame_collector(
        &mut self,
        writer_id: &str,
    ) -> Result<DistributionMode, DistributorError> {
        if self.distribution_mode == DistributionMode::Inactive {
            return Err(DistributorError::InvalidDeregistration(
                self.distribution_mode,
            ));
        }
        let Some(departing) = self.collectors.remove(writer_id) else {
            return Err(DistributorError::NotRegistered(writer_id.to_string()));
        };
        departing.close_collector().await;

        self.distribution_mode = DistributionMode::for_collector_count(self.collectors.len());
        match self.distribution_mode {
            DistributionMode::Inactive => {
                self.release_pool();
                if self.handlers.spill.pending() > 0 {
                    warn!(
                        "(Distributor {}) 最后一个收集器已注销，溢出日志中仍有 {} 帧，留待下一个订阅者回放",
                        self.key,
                        self.handlers.spill.pending()
                    );
                } else {
                    self.routing_mode = RoutingMode::InMemoryRoute;
                }
            }
            DistributionMode::Single => {
                // 幸存者先排空收件箱，再决定是否切换为短路交付
                for survivor in self.collectors.values() {
                    survivor.set_state(CollectorState::Transition);
                }
            }
            DistributionMode::Shared => {}
        }
        self.refresh_spill_required();
        self.check_mode_invariant();
        info!(
            "(Distributor {}) 注销写入端 {}，当前 {} 个收集器，模式 {}",
            self.key,
            writer_id,
            self.collectors.len(),
            self.distribution_mode
        );
        Ok(self.distribution_mode)
    }

    fn refresh_spill_required(&mut self) {
        self.spill_required = self
            .collectors
            .values()
            .any(|c| c.policy().spill_to_disk_on_congestion());
    }
}
