//! 主程序入口和示例用法演示
//!
//! 这个示例展示了如何使用 feed 帧分发库：
//! 1. 创建 `FeedContext` 并启动负载协调器消费运行时报告。
//! 2. 为 intake 运行时创建 `DistributeFeedFrameWriter` (内部启动分发器 actor)。
//! 3. 注册两个订阅者：一个快速，一个慢速且允许拥塞时溢出到磁盘。
//! 4. 推送一批帧，缓冲池耗尽后帧被溢出并在之后按顺序回放。
//! 5. 中途注销快速订阅者 (SHARED -> SINGLE，幸存者进入 TRANSITION)。
//! 6. 关闭：排空所有收集器，打印处理器摘要并验证慢速订阅者收到了全部帧。

use async_trait::async_trait;
use feed_flow::{
    ControlMessage, DistributeFeedFrameWriter, FeedConfig, FeedConnectionId, FeedContext,
    FeedError, FeedId, FeedLoadManager, FeedPolicyAccessor, FeedRuntimeId, FeedRuntimeKey,
    FeedRuntimeType, FrameTupleAppender, FrameWriter, JobController, RecordingWriter,
};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// 只打印请求的作业控制器。
struct LoggingJobController;

#[async_trait]
impl JobController for LoggingJobController {
    async fn compute_locations(&self, _feed_id: &FeedId) -> Result<Vec<String>, FeedError> {
        Ok(vec!["nc1".to_string()])
    }

    async fn intake_locations(&self, _feed_id: &FeedId) -> Result<Vec<String>, FeedError> {
        Ok(vec!["nc1".to_string()])
    }

    async fn store_locations(&self, _c: &FeedConnectionId) -> Result<Vec<String>, FeedError> {
        Ok(vec!["nc2".to_string()])
    }

    async fn nodes_for_substitution(&self, count: usize) -> Result<Vec<String>, FeedError> {
        Ok((0..count).map(|i| format!("spare{}", i)).collect())
    }

    async fn alter_compute_cardinality(
        &self,
        connection_id: &FeedConnectionId,
        cardinality: usize,
        locations: &[String],
    ) -> Result<(), FeedError> {
        info!(
            "(JobController) {} compute 并行度 -> {} {:?}",
            connection_id, cardinality, locations
        );
        Ok(())
    }

    async fn run_message_job(&self, message: ControlMessage, locations: &[String]) -> Result<(), FeedError> {
        info!("(JobController) 消息作业 {:?} -> {:?}", message, locations);
        Ok(())
    }

    async fn submit_job(&self, connection_id: &FeedConnectionId) -> Result<(), FeedError> {
        info!("(JobController) 重新提交 {} 的收集作业", connection_id);
        Ok(())
    }
}

#[tokio::main] // 使用 tokio 作为异步运行时
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --- 初始化日志系统 ---
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO) // 设置日志级别
        .with_target(false) // 不显示模块路径
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("设置全局日志 subscriber 失败");

    info!("========================================================");
    info!("启动 feed 帧分发示例");
    info!("演示特性：共享分发、拥塞溢出与回放、中途退订、排空关闭");
    info!("========================================================");

    // --- 配置参数 ---
    let spill_dir = std::env::temp_dir().join("feed_flow_demo");
    let config = FeedConfig::default()
        .with_frame_size(256)
        .with_pool_capacity(NonZeroUsize::new(4).ok_or("缓冲池容量必须大于 0")?)
        .with_spill_dir(&spill_dir)
        .with_drain_log_interval(Duration::from_secs(1));
    info!(
        "配置: 帧大小={}, 缓冲池容量={}, 溢出目录={}",
        config.frame_size,
        config.pool_capacity,
        spill_dir.display()
    );

    // --- 上下文与协调器 ---
    let (context, messages) = FeedContext::new(config.clone());
    let load_manager = Arc::new(FeedLoadManager::new(Arc::new(LoggingJobController), &config));
    let coordinator_task = tokio::spawn(Arc::clone(&load_manager).run(messages));

    // --- intake 运行时 ---
    let feed = FeedId::new("demo", "tweets");
    let connection = FeedConnectionId::new(feed.clone(), "tweets_ds");
    load_manager.register_connection(connection.clone());
    let key = FeedRuntimeKey::new(feed, FeedRuntimeType::Intake, 0);
    let (upstream, upstream_log) = RecordingWriter::new("upstream");
    let mut feed_writer = DistributeFeedFrameWriter::new(&context, key, Box::new(upstream));
    feed_writer.open().await?;

    let (fast, fast_log) = RecordingWriter::new("fast");
    let (slow, slow_log) = RecordingWriter::new("slow");
    let slow = slow.with_delay(Duration::from_millis(20));
    let runtime = |partition| {
        FeedRuntimeId::new(FeedRuntimeType::Compute, connection.clone(), partition)
    };

    let mode = feed_writer
        .subscribe_feed(
            FeedPolicyAccessor::default(),
            "fast",
            Box::new(fast),
            context.monitor_context(runtime(0)),
        )
        .await?;
    info!("订阅 fast 之后的模式: {}", mode);
    let mode = feed_writer
        .subscribe_feed(
            FeedPolicyAccessor::default().with_spill_to_disk(true),
            "slow",
            Box::new(slow),
            context.monitor_context(runtime(1)),
        )
        .await?;
    info!("订阅 slow 之后的模式: {}", mode);

    // --- 推送帧 ---
    let total_frames = 40u32;
    for i in 0..total_frames {
        let mut appender = FrameTupleAppender::new(config.frame_size)?;
        for j in 0..4u32 {
            let tuple = format!("tweet-{}-{}", i, j);
            if !appender.append(tuple.as_bytes()) {
                warn!("帧 {} 已满，元组 {} 未写入", i, j);
            }
        }
        feed_writer.next_frame(&appender.build()).await?;

        if i == total_frames / 2 {
            let mode = feed_writer.unsubscribe_feed("fast").await?;
            info!("注销 fast 之后的模式: {}", mode);
        }
    }
    let status = feed_writer.distributor().status().await?;
    info!(
        "推送结束: 路由模式 {:?}, 溢出 {} 帧, 已回放 {} 帧, 待回放 {} 帧",
        status.routing_mode, status.spilled_frames, status.replayed_frames, status.pending_spilled_frames
    );

    // --- 关闭 ---
    info!("正在关闭分发器 (排空所有收集器)...");
    feed_writer.close().await?;
    info!("分发器已关闭。上游写入端已关闭: {}", upstream_log.is_closed());

    // --- 验证 ---
    info!("========================================================");
    info!("fast 收到 {} 帧 (已关闭: {})", fast_log.frame_count(), fast_log.is_closed());
    info!("slow 收到 {} 帧 (已关闭: {})", slow_log.frame_count(), slow_log.is_closed());
    if slow_log.frame_count() == total_frames as usize {
        info!("验证通过：slow 收到了全部 {} 帧", total_frames);
    } else {
        error!(
            "验证失败：slow 只收到 {} / {} 帧",
            slow_log.frame_count(),
            total_frames
        );
    }
    info!("========================================================");

    // 所有报告发送端随上下文一起 Drop 后协调器任务退出
    drop(feed_writer);
    drop(context);
    if tokio::time::timeout(Duration::from_secs(5), coordinator_task)
        .await
        .is_err()
    {
        warn!("协调器任务未在超时内退出");
    }
    let _ = std::fs::remove_dir(&spill_dir);
    Ok(())
}
