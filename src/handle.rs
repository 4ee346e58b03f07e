//! 定义 `DistributorHandle`，这是上游运行时与下游订阅者和分发器 actor 交互的主要接口。
//!
//! `DistributorHandle` 封装了与 `FrameDistributor` 进行异步通信的细节：
//! 每个方法构建一个 `Request`，经由 MPSC 通道发送，然后在 oneshot 通道上等待回复。
//!
//! 这个句柄是 `Clone` 的，上游运行时和下游订阅者可以各持一份，
//! 所有请求最终都在 actor 中串行处理。

use crate::collector::FrameCollector;
use crate::error::{DistributorError, FeedError};
use crate::types::{
    DistributionMode, DistributorStatus, FeedRuntimeKey, Request, RoutingMode, WriterId,
};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

/// 与 `FrameDistributor` 交互的句柄。
///
/// 克隆操作只复制内部的 MPSC 发送端。
#[derive(Clone, Debug)]
pub struct DistributorHandle {
    request_tx: mpsc::Sender<Request>,
    key: FeedRuntimeKey,
}

impl DistributorHandle {
    /// 只在 `FrameDistributor::spawn` 中创建初始的 Handle。
    pub(crate) fn new(request_tx: mpsc::Sender<Request>, key: FeedRuntimeKey) -> Self {
        Self { request_tx, key }
    }

    /// 这个分发器服务的 (feed, 运行时类型, 分区)。
    pub fn key(&self) -> &FeedRuntimeKey {
        &self.key
    }

    /// 分发器 actor 是否已经退出。
    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    /// 发送请求并等待回复。
    async fn call<T>(
        &self,
        what: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, FeedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx.send(build(reply_tx)).await.map_err(|e| {
            error!("(Handle {}) 发送 {} 请求失败: {}", self.key, what, e);
            FeedError::SendRequestError(e)
        })?;
        trace!("(Handle {}) {} 请求已发送", self.key, what);
        reply_rx.await.map_err(|e| {
            error!("(Handle {}) 接收 {} 回复失败: {}", self.key, what, e);
            FeedError::ReceiveReplyError(e)
        })
    }

    /// 把分发器报告的业务错误包装进 `FeedError`。
    fn lift<T>(&self, what: &str, result: Result<T, DistributorError>) -> Result<T, FeedError> {
        result.map_err(|e| {
            error!("(Handle {}) {} 失败 (Distributor Error): {}", self.key, what, e);
            FeedError::Distributor(e)
        })
    }

    /// 注册一个下游订阅者。分发器会先打开它的写入端。
    ///
    /// # Returns
    ///
    /// * `Ok(DistributionMode)`: 注册之后的分发模式。
    /// * `Err(FeedError::Distributor(AlreadyRegistered | WriterOpenFailed))`: 业务错误。
    pub async fn register(&self, collector: FrameCollector) -> Result<DistributionMode, FeedError> {
        let writer_id = collector.writer_id().clone();
        let result = self
            .call("Register", |reply_tx| Request::Register {
                collector,
                reply_tx,
            })
            .await?;
        let mode = self.lift("Register", result)?;
        debug!("(Handle {}) 写入端 {} 已注册，模式 {}", self.key, writer_id, mode);
        Ok(mode)
    }

    /// 注销一个订阅者。它的收集器会继续排空已入队的帧，然后关闭写入端。
    pub async fn deregister(&self, writer_id: impl Into<WriterId>) -> Result<DistributionMode, FeedError> {
        let writer_id = writer_id.into();
        let result = self
            .call("Deregister", |reply_tx| Request::Deregister {
                writer_id,
                reply_tx,
            })
            .await?;
        self.lift("Deregister", result)
    }

    /// 交给分发器一帧。短路交付时在写入端处理完毕之后才返回。
    ///
    /// 返回处理该帧之后的路由模式。
    pub async fn next_frame(&self, frame: Bytes) -> Result<RoutingMode, FeedError> {
        let result = self
            .call("NextFrame", |reply_tx| Request::NextFrame { frame, reply_tx })
            .await?;
        self.lift("NextFrame", result)
    }

    /// 数据流结束。与数据帧经过同一个通道，因此排在之前发送的所有帧之后。
    pub async fn notify_end_of_feed(&self) -> Result<(), FeedError> {
        self.call("EndOfFeed", |reply_tx| Request::EndOfFeed { reply_tx })
            .await
    }

    /// 关闭分发器：排空所有收集器并归还资源，然后 actor 退出。
    ///
    /// 返回关闭时的最终状态快照。之后的请求都会失败。
    pub async fn close(&self) -> Result<DistributorStatus, FeedError> {
        let result = self
            .call("Close", |reply_tx| Request::Close { reply_tx })
            .await?;
        self.lift("Close", result)
    }

    pub async fn status(&self) -> Result<DistributorStatus, FeedError> {
        self.call("Status", |reply_tx| Request::Status { reply_tx })
            .await
    }

    pub async fn distribution_mode(&self) -> Result<DistributionMode, FeedError> {
        let status = self.status().await?;
        status.distribution_mode.ok_or_else(|| {
            FeedError::Distributor(DistributorError::Internal(
                "状态快照缺少分发模式".to_string(),
            ))
        })
    }

    pub async fn routing_mode(&self) -> Result<RoutingMode, FeedError> {
        let status = self.status().await?;
        status.routing_mode.ok_or_else(|| {
            FeedError::Distributor(DistributorError::Internal(
                "状态快照缺少路由模式".to_string(),
            ))
        })
    }

    pub async fn is_registered(&self, writer_id: impl Into<WriterId>) -> Result<bool, FeedError> {
        let writer_id = writer_id.into();
        self.call("IsRegistered", |reply_tx| Request::IsRegistered {
            writer_id,
            reply_tx,
        })
        .await
    }

    /// 运行时并行度变化后通知所有收集器。
    pub async fn set_number_of_partitions(&self, partitions: usize) -> Result<(), FeedError> {
        self.call("SetPartitions", |reply_tx| Request::SetPartitions {
            partitions,
            reply_tx,
        })
        .await
    }

    /// 转交协调器对提交确认的回复。
    pub async fn receive_commit_ack_response(
        &self,
        intake_partition: u32,
        max_window_acked: u64,
    ) -> Result<(), FeedError> {
        self.call("CommitAckResponse", |reply_tx| Request::CommitAckResponse {
            intake_partition,
            max_window_acked,
            reply_tx,
        })
        .await
    }
}
