//! 帧路由：短路交付、经由缓冲池的内存路由、拥塞时的溢出与丢弃，以及溢出日志的回放。

use super::FrameDistributor;
use crate::bucket::{ContentType, DataBucket, DataBucketPool};
use crate::error::{DistributorError, FeedError};
use crate::types::{CollectorState, DistributionMode, InputMode, RoutingMode};
use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

fn spill_error(e: FeedError) -> DistributorError {
    DistributorError::SpillIo(e.to_string())
}

impl FrameDistributor {
    /// 路由一帧。返回处理该帧之后的路由模式。
    pub(super) async fn next_frame(&mut self, frame: Bytes) -> Result<RoutingMode, DistributorError> {
        if frame.len() != self.config.frame_size {
            warn!(
                "(Distributor {}) 拒绝长度为 {} 的帧 (配置的帧大小为 {})",
                self.key,
                frame.len(),
                self.config.frame_size
            );
            return Err(DistributorError::InvalidFrameSize {
                expected: self.config.frame_size,
                actual: frame.len(),
            });
        }
        match self.distribution_mode {
            DistributionMode::Inactive => {
                trace!("(Distributor {}) 没有订阅者，丢弃一帧", self.key);
                Ok(self.routing_mode)
            }
            DistributionMode::Single => self.next_frame_single(frame).await,
            DistributionMode::Shared => self.route_via_pool(frame).await,
        }
    }

    async fn next_frame_single(&mut self, frame: Bytes) -> Result<RoutingMode, DistributorError> {
        let (state, pending) = match self.collectors.values().next() {
            Some(collector) => (collector.state(), collector.pending_work()),
            None => {
                return Err(DistributorError::Internal(
                    "SINGLE 模式下没有收集器".to_string(),
                ))
            }
        };
        // 收件箱与溢出日志都已清空时才能切换到同步交付，否则会打乱顺序
        let backlog_clear = pending == 0
            && self.routing_mode == RoutingMode::InMemoryRoute
            && self.handlers.spill.pending() == 0;

        match state {
            CollectorState::Finished => {
                warn!(
                    "(Distributor {}) 唯一的收集器已结束，丢弃一帧",
                    self.key
                );
                Ok(self.routing_mode)
            }
            CollectorState::Transition if backlog_clear => {
                info!(
                    "(Distributor {}) 幸存的收集器已排空，TRANSITION -> ACTIVE",
                    self.key
                );
                for collector in self.collectors.values() {
                    collector.set_state(CollectorState::Active);
                }
                if self.config.short_circuit {
                    self.deliver_direct(frame).await
                } else {
                    self.route_via_pool(frame).await
                }
            }
            CollectorState::Active if self.config.short_circuit && backlog_clear => {
                self.deliver_direct(frame).await
            }
            CollectorState::Transition | CollectorState::Active => {
                self.route_via_pool(frame).await
            }
        }
    }

    /// 同步交付给唯一的收集器，调用者在写入端完成之前不会收到回复。
    async fn deliver_direct(&mut self, frame: Bytes) -> Result<RoutingMode, DistributorError> {
        self.release_pool_if_idle();
        let Some(collector) = self.collectors.values().next() else {
            return Err(DistributorError::Internal(
                "短路交付时没有收集器".to_string(),
            ));
        };
        match collector.next_frame(frame).await {
            Ok(()) => self.short_circuit_frames += 1,
            Err(e) => error!(
                "(Distributor {}) 短路交付给 {} 失败: {}",
                self.key,
                collector.writer_id(),
                e
            ),
        }
        Ok(self.routing_mode)
    }

    /// 缓冲池中已没有在用的 bucket 时归还它。
    fn release_pool_if_idle(&mut self) {
        if self.pool.as_ref().is_some_and(|pool| pool.in_use() == 0) {
            self.release_pool();
        }
    }

    /// 经由缓冲池交付，按当前路由模式处理。
    async fn route_via_pool(&mut self, frame: Bytes) -> Result<RoutingMode, DistributorError> {
        let pool = self.ensure_pool();
        for collector in self.collectors.values_mut() {
            collector.start();
        }
        match self.routing_mode {
            RoutingMode::InMemoryRoute => self.deliver_or_congest(&pool, frame).await,
            RoutingMode::SpillToDisk => self.replay_then_route(&pool, frame).await,
            RoutingMode::Discard => {
                // 每一帧都重新尝试分配，池恢复后立即回到内存路由
                match pool.get_data_bucket(frame.clone(), self.collectors.len()) {
                    Some(bucket) => {
                        info!(
                            "(Distributor {}) 缓冲池已恢复，DISCARD -> IN_MEMORY_ROUTE",
                            self.key
                        );
                        self.routing_mode = RoutingMode::InMemoryRoute;
                        self.deliver_bucket(bucket);
                        Ok(self.routing_mode)
                    }
                    None => self.on_congestion(frame).await,
                }
            }
        }
    }

    async fn deliver_or_congest(
        &mut self,
        pool: &DataBucketPool,
        frame: Bytes,
    ) -> Result<RoutingMode, DistributorError> {
        match pool.get_data_bucket(frame.clone(), self.collectors.len()) {
            Some(bucket) => {
                self.deliver_bucket(bucket);
                Ok(self.routing_mode)
            }
            None => self.on_congestion(frame).await,
        }
    }

    fn deliver_bucket(&mut self, bucket: std::sync::Arc<DataBucket>) {
        self.handlers
            .in_memory
            .handle_data_bucket(bucket, self.collectors.values());
    }

    /// 缓冲池耗尽：有收集器允许溢出时写入磁盘，否则丢弃。
    async fn on_congestion(&mut self, frame: Bytes) -> Result<RoutingMode, DistributorError> {
        if self.spill_required {
            if self.routing_mode != RoutingMode::SpillToDisk {
                warn!(
                    "(Distributor {}) 缓冲池耗尽，{} -> SPILL_TO_DISK",
                    self.key, self.routing_mode
                );
                self.routing_mode = RoutingMode::SpillToDisk;
            }
            self.handlers
                .spill
                .handle_frame(&frame)
                .await
                .map_err(spill_error)?;
        } else {
            if self.routing_mode != RoutingMode::Discard {
                warn!(
                    "(Distributor {}) 缓冲池耗尽且没有收集器允许溢出，{} -> DISCARD",
                    self.key, self.routing_mode
                );
                for summary in self.handlers.summaries() {
                    info!("(Distributor {}) {}", self.key, summary);
                }
                self.routing_mode = RoutingMode::Discard;
            }
            self.handlers.discard.handle_frame(&frame);
            debug!("(Distributor {}) {}", self.key, self.handlers.discard.summary());
        }
        Ok(self.routing_mode)
    }

    /// 先尽可能回放溢出日志；日志清空后新帧才进入内存路由，否则追加到日志末尾。
    async fn replay_then_route(
        &mut self,
        pool: &DataBucketPool,
        frame: Bytes,
    ) -> Result<RoutingMode, DistributorError> {
        let readers = self.collectors.len();
        let mut replayed = 0usize;
        while let Some(spilled) = self.handlers.spill.peek_next().await.map_err(spill_error)? {
            let Some(bucket) = pool.get_data_bucket(spilled, readers) else {
                if replayed > 0 {
                    debug!(
                        "(Distributor {}) 回放了 {} 帧后缓冲池再次耗尽",
                        self.key, replayed
                    );
                }
                self.handlers
                    .spill
                    .handle_frame(&frame)
                    .await
                    .map_err(spill_error)?;
                return Ok(self.routing_mode);
            };
            if replayed == 0 {
                self.set_input_mode(InputMode::ProcessSpill);
            }
            self.deliver_bucket(bucket);
            self.handlers.spill.advance();
            replayed += 1;
        }
        self.finish_replay().await?;
        self.deliver_or_congest(pool, frame).await
    }

    /// 溢出日志已回放完毕：截断日志，通知收集器，回到内存路由。
    async fn finish_replay(&mut self) -> Result<(), DistributorError> {
        self.handlers
            .spill
            .reset_if_drained()
            .await
            .map_err(spill_error)?;
        let readers = self.collectors.len();
        if readers > 0 {
            let marker = DataBucket::marker(ContentType::Eosd, readers);
            for collector in self.collectors.values() {
                collector.send_message(marker.clone());
            }
        }
        info!(
            "(Distributor {}) 溢出日志回放完毕，SPILL_TO_DISK -> IN_MEMORY_ROUTE",
            self.key
        );
        self.routing_mode = RoutingMode::InMemoryRoute;
        Ok(())
    }

    /// 用阻塞式分配回放溢出日志中的全部帧。结束数据流与关闭之前调用。
    pub(super) async fn drain_spill_blocking(&mut self) -> Result<(), DistributorError> {
        if self.handlers.spill.pending() == 0 {
            if self.routing_mode == RoutingMode::SpillToDisk && !self.collectors.is_empty() {
                self.finish_replay().await?;
            }
            return Ok(());
        }
        if self.collectors.is_empty() {
            warn!(
                "(Distributor {}) 没有收集器，溢出日志中的 {} 帧无法回放",
                self.key,
                self.handlers.spill.pending()
            );
            return Ok(());
        }
        info!(
            "(Distributor {}) 回放溢出日志中剩余的 {} 帧",
            self.key,
            self.handlers.spill.pending()
        );
        let pool = self.ensure_pool();
        for collector in self.collectors.values_mut() {
            collector.start();
        }
        self.set_input_mode(InputMode::ProcessSpill);
        let readers = self.collectors.len();
        while let Some(spilled) = self.handlers.spill.peek_next().await.map_err(spill_error)? {
            let bucket = match pool.get_data_bucket(spilled.clone(), readers) {
                Some(bucket) => bucket,
                None => pool.acquire(spilled, readers).await,
            };
            self.deliver_bucket(bucket);
            self.handlers.spill.advance();
        }
        self.finish_replay().await
    }

    fn set_input_mode(&self, mode: InputMode) {
        for collector in self.collectors.values() {
            collector.set_input_mode(mode);
        }
    }
}
