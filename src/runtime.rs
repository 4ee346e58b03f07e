//! 可订阅的运行时：上游算子的输出经由分发器扇出给下游订阅者。
//!
//! `DistributeFeedFrameWriter` 代替上游算子原本的写入端，把帧交给分发器；
//! `IngestionRuntime` 在其上管理 intake 适配器的启停。

use crate::collector::FrameCollector;
use crate::config::FeedPolicyAccessor;
use crate::context::FeedContext;
use crate::error::{DistributorError, FeedError};
use crate::handle::DistributorHandle;
use crate::monitor::MonitorContext;
use crate::types::{DistributionMode, FeedRuntimeKey, WriterId};
use crate::writer::FrameWriter;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

/// 上游算子的输出端：帧交给分发器，生命周期事件转给原来的写入端。
pub struct DistributeFeedFrameWriter {
    key: FeedRuntimeKey,
    distributor: DistributorHandle,
    writer: Box<dyn FrameWriter>,
    context: FeedContext,
}

impl DistributeFeedFrameWriter {
    pub fn new(context: &FeedContext, key: FeedRuntimeKey, writer: Box<dyn FrameWriter>) -> Self {
        let distributor = context.get_or_create_distributor(key.clone());
        Self {
            key,
            distributor,
            writer,
            context: context.clone(),
        }
    }

    pub fn key(&self) -> &FeedRuntimeKey {
        &self.key
    }

    pub fn distributor(&self) -> &DistributorHandle {
        &self.distributor
    }

    /// 订阅：为写入端创建收集器并注册到分发器。重复订阅返回 `AlreadyRegistered`。
    pub async fn subscribe_feed(
        &self,
        policy: FeedPolicyAccessor,
        writer_id: impl Into<WriterId>,
        writer: Box<dyn FrameWriter>,
        monitor: MonitorContext,
    ) -> Result<DistributionMode, FeedError> {
        let writer_id = writer_id.into();
        if self.distributor.is_registered(writer_id.clone()).await? {
            return Err(DistributorError::AlreadyRegistered(writer_id).into());
        }
        let collector = FrameCollector::new(writer_id.clone(), writer, policy, monitor);
        let mode = self.distributor.register(collector).await?;
        info!(
            "(FeedWriter {}) 订阅者 {} 已注册，新模式 {}",
            self.key, writer_id, mode
        );
        Ok(mode)
    }

    /// 退订。未注册的写入端返回 `NotRegistered`。
    pub async fn unsubscribe_feed(&self, writer_id: impl Into<WriterId>) -> Result<DistributionMode, FeedError> {
        let writer_id = writer_id.into();
        let mode = self.distributor.deregister(writer_id.clone()).await?;
        info!(
            "(FeedWriter {}) 订阅者 {} 已注销，新模式 {}",
            self.key, writer_id, mode
        );
        Ok(mode)
    }

    pub async fn notify_end_of_feed(&self) -> Result<(), FeedError> {
        self.distributor.notify_end_of_feed().await
    }

    pub async fn distribution_mode(&self) -> Result<DistributionMode, FeedError> {
        self.distributor.distribution_mode().await
    }
}

#[async_trait]
impl FrameWriter for DistributeFeedFrameWriter {
    async fn open(&mut self) -> Result<(), FeedError> {
        self.writer.open().await
    }

    async fn next_frame(&mut self, frame: &Bytes) -> Result<(), FeedError> {
        self.distributor.next_frame(frame.clone()).await.map(|_| ())
    }

    /// 先排空并关闭分发器，再关闭原来的写入端。
    async fn close(&mut self) -> Result<(), FeedError> {
        let status = self.distributor.close().await?;
        for summary in &status.summaries {
            info!("(FeedWriter {}) {}", self.key, summary);
        }
        self.context.remove_distributor(&self.key);
        self.writer.close().await
    }

    /// 失败只传给原来的写入端，不清理分发器。
    async fn fail(&mut self) -> Result<(), FeedError> {
        self.writer.fail().await
    }
}

/// intake 适配器的启停控制。
#[async_trait]
pub trait AdapterRuntimeManager: Send + Sync {
    async fn start(&self) -> Result<(), FeedError>;

    async fn stop(&self) -> Result<(), FeedError>;
}

/// intake 阶段的可订阅运行时：第一个订阅者到来时启动适配器，最后一个离开时停止。
pub struct IngestionRuntime {
    feed_writer: DistributeFeedFrameWriter,
    adapter: Arc<dyn AdapterRuntimeManager>,
    subscribers: Vec<WriterId>,
}

impl IngestionRuntime {
    pub fn new(feed_writer: DistributeFeedFrameWriter, adapter: Arc<dyn AdapterRuntimeManager>) -> Self {
        Self {
            feed_writer,
            adapter,
            subscribers: Vec::new(),
        }
    }

    pub fn key(&self) -> &FeedRuntimeKey {
        self.feed_writer.key()
    }

    pub fn feed_writer(&self) -> &DistributeFeedFrameWriter {
        &self.feed_writer
    }

    /// 适配器通过它向下游推送帧。
    pub fn feed_writer_mut(&mut self) -> &mut DistributeFeedFrameWriter {
        &mut self.feed_writer
    }

    pub fn adapter(&self) -> &Arc<dyn AdapterRuntimeManager> {
        &self.adapter
    }

    pub fn subscribers(&self) -> &[WriterId] {
        &self.subscribers
    }

    pub async fn subscribe_feed(
        &mut self,
        policy: FeedPolicyAccessor,
        writer_id: impl Into<WriterId>,
        writer: Box<dyn FrameWriter>,
        monitor: MonitorContext,
    ) -> Result<DistributionMode, FeedError> {
        let writer_id = writer_id.into();
        let mode = self
            .feed_writer
            .subscribe_feed(policy, writer_id.clone(), writer, monitor)
            .await?;
        if mode == DistributionMode::Single {
            debug!("(IngestionRuntime {}) 第一个订阅者，启动适配器", self.key());
            self.adapter.start().await?;
        }
        info!(
            "(IngestionRuntime {}) 订阅者 {} 已加入",
            self.key(),
            writer_id
        );
        self.subscribers.push(writer_id);
        Ok(mode)
    }

    pub async fn unsubscribe_feed(&mut self, writer_id: impl Into<WriterId>) -> Result<DistributionMode, FeedError> {
        let writer_id = writer_id.into();
        let mode = self.feed_writer.unsubscribe_feed(writer_id.clone()).await?;
        if mode == DistributionMode::Inactive {
            info!(
                "(IngestionRuntime {}) 已没有订阅者，停止适配器",
                self.key()
            );
            self.adapter.stop().await?;
        }
        self.subscribers.retain(|id| *id != writer_id);
        Ok(mode)
    }

    pub async fn end_of_feed(&self) -> Result<(), FeedError> {
        self.feed_writer.notify_end_of_feed().await?;
        info!("(IngestionRuntime {}) 已通知数据流结束", self.key());
        Ok(())
    }
}
