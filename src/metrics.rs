//! 速率指标收集。
//!
//! 监控缓冲区为每个运行时创建流入/流出两个上报者 (report sender)，
//! 每收到或转发一帧就上报该帧的元组数；速率为滑动窗口内的元组总数除以窗口秒数。

use crate::types::{FeedConnectionId, FeedRuntimeId, SenderId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 上报值的含义。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    InflowRate,
    OutflowRate,
}

/// 指标的聚合方式。目前只有速率。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Rate,
}

/// 指标收集器。实现必须可以在多个任务间共享。
pub trait MetricCollector: Send + Sync {
    fn create_report_sender(
        &self,
        connection_id: &FeedConnectionId,
        runtime_id: &FeedRuntimeId,
        value_type: ValueType,
        metric_type: MetricType,
    ) -> SenderId;

    /// 上报一次计数 (通常是一帧的元组数)。
    fn send_report(&self, sender: SenderId, count: usize);

    /// 当前速率 (tuples/sec)。未知的上报者返回 0。
    fn get_metric(&self, sender: SenderId) -> i64;

    /// 清空上报者已有的样本。
    fn reset_report_sender(&self, sender: SenderId);

    fn remove_report_sender(&self, sender: SenderId);
}

#[derive(Debug)]
struct SenderSeries {
    name: String,
    samples: VecDeque<(Instant, u64)>,
}

/// 基于滑动时间窗口的默认速率收集器。
///
/// 时间取自 `tokio::time::Instant`，在暂停时钟的测试中可以确定性地推进。
#[derive(Debug)]
pub struct RateMetricCollector {
    window: Duration,
    next_sender_id: AtomicU64,
    senders: Mutex<HashMap<SenderId, SenderSeries>>,
}

impl RateMetricCollector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_sender_id: AtomicU64::new(1),
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn with_senders<R>(&self, f: impl FnOnce(&mut HashMap<SenderId, SenderSeries>) -> R) -> R {
        match self.senders.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// 当前登记的上报者数量。
    pub fn sender_count(&self) -> usize {
        self.with_senders(|senders| senders.len())
    }
}

impl Default for RateMetricCollector {
    fn default() -> Self {
        Self::new(crate::defaults::METRIC_WINDOW)
    }
}

impl MetricCollector for RateMetricCollector {
    fn create_report_sender(
        &self,
        connection_id: &FeedConnectionId,
        runtime_id: &FeedRuntimeId,
        value_type: ValueType,
        metric_type: MetricType,
    ) -> SenderId {
        let id = self.next_sender_id.fetch_add(1, Ordering::AcqRel);
        let name = format!(
            "{}:{}:{:?}:{:?}",
            connection_id, runtime_id, value_type, metric_type
        );
        debug!("(Metrics) 创建上报者 {} -> {}", id, name);
        self.with_senders(|senders| {
            senders.insert(
                id,
                SenderSeries {
                    name,
                    samples: VecDeque::new(),
                },
            );
        });
        id
    }

    fn send_report(&self, sender: SenderId, count: usize) {
        let now = Instant::now();
        let window = self.window;
        self.with_senders(|senders| match senders.get_mut(&sender) {
            Some(series) => {
                Self::prune(&mut series.samples, now, window);
                series.samples.push_back((now, count as u64));
            }
            None => debug!("(Metrics) 向未知上报者 {} 上报，已忽略", sender),
        });
    }

    fn get_metric(&self, sender: SenderId) -> i64 {
        let now = Instant::now();
        let window = self.window;
        self.with_senders(|senders| match senders.get_mut(&sender) {
            Some(series) => {
                Self::prune(&mut series.samples, now, window);
                let total: u64 = series.samples.iter().map(|(_, c)| *c).sum();
                let secs = window.as_secs_f64();
                if secs <= 0.0 {
                    0
                } else {
                    (total as f64 / secs) as i64
                }
            }
            None => 0,
        })
    }

    fn reset_report_sender(&self, sender: SenderId) {
        self.with_senders(|senders| {
            if let Some(series) = senders.get_mut(&sender) {
                debug!("(Metrics) 重置上报者 {}", series.name);
                series.samples.clear();
            }
        });
    }

    fn remove_report_sender(&self, sender: SenderId) {
        self.with_senders(|senders| {
            senders.remove(&sender);
        });
    }
}
