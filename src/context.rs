//! 显式构造并向下传递的运行上下文。
//!
//! 持有配置、内存管理器、指标收集器、报告通道，以及按
//! (feed, 运行时类型, 分区) 索引的分发器注册表。

use crate::bucket::FeedMemoryManager;
use crate::config::FeedConfig;
use crate::distributor::FrameDistributor;
use crate::handle::DistributorHandle;
use crate::metrics::{MetricCollector, RateMetricCollector};
use crate::monitor::MonitorContext;
use crate::types::{FeedMessage, FeedRuntimeId, FeedRuntimeKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

struct ContextInner {
    config: FeedConfig,
    memory_manager: FeedMemoryManager,
    metric_collector: Arc<dyn MetricCollector>,
    messages: mpsc::UnboundedSender<FeedMessage>,
    distributors: Mutex<HashMap<FeedRuntimeKey, DistributorHandle>>,
}

/// 一个节点上所有 feed 运行时共享的上下文。克隆只增加引用计数。
#[derive(Clone)]
pub struct FeedContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for FeedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedContext")
            .field("pool_capacity", &self.inner.memory_manager.pool_capacity())
            .field("distributors", &self.distributor_count())
            .finish()
    }
}

impl FeedContext {
    /// 使用默认的滑动窗口速率收集器创建上下文。
    /// 返回的接收端收到所有运行时发出的报告，通常交给 `FeedLoadManager::run`。
    pub fn new(config: FeedConfig) -> (Self, mpsc::UnboundedReceiver<FeedMessage>) {
        let collector = Arc::new(RateMetricCollector::new(config.metric_window));
        Self::with_metric_collector(config, collector)
    }

    pub fn with_metric_collector(
        config: FeedConfig,
        metric_collector: Arc<dyn MetricCollector>,
    ) -> (Self, mpsc::UnboundedReceiver<FeedMessage>) {
        let (messages, rx) = mpsc::unbounded_channel();
        let memory_manager = FeedMemoryManager::new(config.pool_capacity);
        let context = Self {
            inner: Arc::new(ContextInner {
                config,
                memory_manager,
                metric_collector,
                messages,
                distributors: Mutex::new(HashMap::new()),
            }),
        };
        (context, rx)
    }

    pub fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    pub fn memory_manager(&self) -> &FeedMemoryManager {
        &self.inner.memory_manager
    }

    pub fn metric_collector(&self) -> Arc<dyn MetricCollector> {
        Arc::clone(&self.inner.metric_collector)
    }

    pub fn message_sender(&self) -> mpsc::UnboundedSender<FeedMessage> {
        self.inner.messages.clone()
    }

    /// 为某个运行时创建监控上下文，接上共享的指标收集器与报告通道。
    pub fn monitor_context(&self, runtime_id: FeedRuntimeId) -> MonitorContext {
        MonitorContext::new(runtime_id, self.inner.config.clone())
            .with_metric_collector(self.metric_collector())
            .with_messages(self.message_sender())
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<FeedRuntimeKey, DistributorHandle>> {
        match self.inner.distributors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 返回该键的分发器，不存在 (或已关闭) 时启动一个新的。
    pub fn get_or_create_distributor(&self, key: FeedRuntimeKey) -> DistributorHandle {
        let mut registry = self.registry();
        if let Some(handle) = registry.get(&key) {
            if !handle.is_closed() {
                return handle.clone();
            }
            debug!("(FeedContext) 分发器 {} 已关闭，重新创建", key);
        }
        let handle = FrameDistributor::spawn(
            key.clone(),
            self.inner.config.clone(),
            self.inner.memory_manager.clone(),
        );
        info!("(FeedContext) 创建分发器 {}", key);
        registry.insert(key, handle.clone());
        handle
    }

    pub fn distributor(&self, key: &FeedRuntimeKey) -> Option<DistributorHandle> {
        self.registry().get(key).cloned()
    }

    pub fn remove_distributor(&self, key: &FeedRuntimeKey) -> Option<DistributorHandle> {
        let removed = self.registry().remove(key);
        if removed.is_some() {
            debug!("(FeedContext) 移除分发器 {}", key);
        }
        removed
    }

    pub fn distributor_count(&self) -> usize {
        self.registry().len()
    }
}
