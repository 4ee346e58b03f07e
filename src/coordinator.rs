//! 负载与扩缩容协调。
//!
//! `FeedLoadManager` 消费运行时发出的拥塞与缩容报告，通过外部的 `JobController`
//! 调整 compute 阶段的并行度：先两阶段地平滑停止数据流，等待一段稳定时间，
//! 然后重新提交修改后的作业。同一连接在恢复期间的后续报告会被忽略。

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::types::{
    CongestionReport, FeedConnectionId, FeedId, FeedMessage, ScaleInReport,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 发往运行时所在节点的控制消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// 准备停顿：compute 阶段只保留前 `retain_compute_partitions` 个分区
    /// (`None` 表示全部保留)。
    PrepareStall {
        connection_id: FeedConnectionId,
        retain_compute_partitions: Option<usize>,
    },
    /// 在 intake 处终止数据流。
    TerminateDataFlow { connection_id: FeedConnectionId },
}

/// 外部作业控制器。
#[async_trait]
pub trait JobController: Send + Sync {
    async fn compute_locations(&self, feed_id: &FeedId) -> Result<Vec<String>, FeedError>;

    async fn intake_locations(&self, feed_id: &FeedId) -> Result<Vec<String>, FeedError>;

    async fn store_locations(&self, connection_id: &FeedConnectionId) -> Result<Vec<String>, FeedError>;

    /// 挑选 `count` 个可以承载额外 compute 分区的节点。
    async fn nodes_for_substitution(&self, count: usize) -> Result<Vec<String>, FeedError>;

    /// 修改收集作业中 compute 阶段的并行度与位置。
    async fn alter_compute_cardinality(
        &self,
        connection_id: &FeedConnectionId,
        cardinality: usize,
        locations: &[String],
    ) -> Result<(), FeedError>;

    /// 在给定节点上运行一个消息作业并等待其完成。
    async fn run_message_job(&self, message: ControlMessage, locations: &[String]) -> Result<(), FeedError>;

    /// 提交修改后的收集作业，不等待完成。
    async fn submit_job(&self, connection_id: &FeedConnectionId) -> Result<(), FeedError>;
}

/// 一条连接上收集作业的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedJobState {
    Active,
    CongestionReported,
    UnderRecovery,
}

impl fmt::Display for FeedJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedJobState::Active => "ACTIVE",
            FeedJobState::CongestionReported => "CONGESTION_REPORTED",
            FeedJobState::UnderRecovery => "UNDER_RECOVERY",
        };
        f.write_str(name)
    }
}

pub struct FeedLoadManager {
    controller: Arc<dyn JobController>,
    settle_delay: Duration,
    job_states: Mutex<HashMap<FeedConnectionId, FeedJobState>>,
    /// 每个 (连接, intake 分区) 已收到提交确认的最大窗口。
    acked_bases: Mutex<HashMap<(FeedConnectionId, u32), u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FeedLoadManager {
    pub fn new(controller: Arc<dyn JobController>, config: &FeedConfig) -> Self {
        Self {
            controller,
            settle_delay: config.settle_delay,
            job_states: Mutex::new(HashMap::new()),
            acked_bases: Mutex::new(HashMap::new()),
        }
    }

    /// 登记一条正在运行的连接。
    pub fn register_connection(&self, connection_id: FeedConnectionId) {
        lock(&self.job_states).insert(connection_id, FeedJobState::Active);
    }

    pub fn job_state(&self, connection_id: &FeedConnectionId) -> Option<FeedJobState> {
        lock(&self.job_states).get(connection_id).copied()
    }

    fn set_job_state(&self, connection_id: &FeedConnectionId, state: FeedJobState) {
        debug!("(LoadManager) {} -> {}", connection_id, state);
        lock(&self.job_states).insert(connection_id.clone(), state);
    }

    /// 修改后的作业已经运行起来，重新接受该连接的报告。
    pub fn recovery_complete(&self, connection_id: &FeedConnectionId) {
        info!("(LoadManager) 连接 {} 恢复完成", connection_id);
        self.set_job_state(connection_id, FeedJobState::Active);
    }

    pub fn max_acked_base(&self, connection_id: &FeedConnectionId, intake_partition: u32) -> Option<u64> {
        lock(&self.acked_bases)
            .get(&(connection_id.clone(), intake_partition))
            .copied()
    }

    /// 处理拥塞报告：按流入/流出速率之比扩大 compute 并行度。
    ///
    /// 返回 `Ok(false)` 表示报告被忽略。
    pub async fn report_congestion(&self, report: &CongestionReport) -> Result<bool, FeedError> {
        let connection_id = &report.connection_id;
        // 检查与置位在同一把锁内完成，并发到达的报告只有一个会被处理
        {
            let mut states = lock(&self.job_states);
            if let Some(state @ (FeedJobState::CongestionReported | FeedJobState::UnderRecovery)) =
                states.get(connection_id).copied()
            {
                info!(
                    "(LoadManager) 忽略来自 {} 的拥塞报告，连接处于 {}",
                    report.runtime_id, state
                );
                return Ok(false);
            }
            states.insert(connection_id.clone(), FeedJobState::CongestionReported);
        }
        if report.outflow_rate <= 0 {
            warn!(
                "(LoadManager) 拥塞报告的流出速率为 {}，无法计算所需并行度",
                report.outflow_rate
            );
            self.set_job_state(connection_id, FeedJobState::Active);
            return Ok(false);
        }

        let result = self.scale_out(report).await;
        if let Err(e) = &result {
            error!("(LoadManager) 无法为 {} 扩容: {}", connection_id, e);
            self.set_job_state(connection_id, FeedJobState::Active);
        }
        result
    }

    async fn scale_out(&self, report: &CongestionReport) -> Result<bool, FeedError> {
        let connection_id = &report.connection_id;
        let current = self
            .controller
            .compute_locations(&connection_id.feed_id)
            .await?;
        let cardinality = current.len();
        let required = required_cardinality(cardinality, report.inflow_rate, report.outflow_rate);
        if required <= cardinality {
            info!(
                "(LoadManager) {} 当前并行度 {} 已足够 (需要 {})",
                connection_id, cardinality, required
            );
            self.set_job_state(connection_id, FeedJobState::Active);
            return Ok(false);
        }
        self.set_job_state(connection_id, FeedJobState::UnderRecovery);
        let helpers = self
            .controller
            .nodes_for_substitution(required - cardinality)
            .await?;
        let mut locations = current;
        locations.extend(helpers);
        info!(
            "(LoadManager) {} 拥塞 (流入 {}/s, 流出 {}/s)，compute 并行度 {} -> {}",
            connection_id, report.inflow_rate, report.outflow_rate, cardinality, required
        );
        self.controller
            .alter_compute_cardinality(connection_id, required, &locations)
            .await?;
        self.gracefully_terminate_data_flow(connection_id, None).await?;
        tokio::time::sleep(self.settle_delay).await;
        self.controller.submit_job(connection_id).await?;
        Ok(true)
    }

    /// 处理缩容建议。未登记或正在恢复的连接忽略报告，返回 `Ok(false)`。
    pub async fn submit_scale_in_report(&self, report: &ScaleInReport) -> Result<bool, FeedError> {
        let connection_id = &report.connection_id;
        {
            let mut states = lock(&self.job_states);
            match states.get(connection_id).copied() {
                None => {
                    info!("(LoadManager) 没有 {} 的作业状态，忽略缩容建议", connection_id);
                    return Ok(false);
                }
                Some(FeedJobState::UnderRecovery) => {
                    info!("(LoadManager) {} 正在恢复，忽略缩容建议", connection_id);
                    return Ok(false);
                }
                Some(_) => {
                    states.insert(connection_id.clone(), FeedJobState::UnderRecovery);
                }
            }
        }

        let result = self.scale_in(report).await;
        if let Err(e) = &result {
            error!("(LoadManager) 无法为 {} 缩容: {}", connection_id, e);
            self.set_job_state(connection_id, FeedJobState::Active);
        }
        result.map(|()| true)
    }

    async fn scale_in(&self, report: &ScaleInReport) -> Result<(), FeedError> {
        let connection_id = &report.connection_id;
        let reduced = report.reduced_cardinality.max(1);
        info!(
            "(LoadManager) 处理 {} 的缩容建议: {} -> {}",
            connection_id, report.current_cardinality, reduced
        );
        let current = self
            .controller
            .compute_locations(&connection_id.feed_id)
            .await?;
        let retained: Vec<String> = current.into_iter().take(reduced).collect();
        self.controller
            .alter_compute_cardinality(connection_id, reduced, &retained)
            .await?;
        self.gracefully_terminate_data_flow(connection_id, Some(reduced - 1))
            .await?;
        tokio::time::sleep(self.settle_delay).await;
        self.controller.submit_job(connection_id).await?;
        info!("(LoadManager) 已为 {} 提交缩容后的作业", connection_id);
        Ok(())
    }

    /// 两阶段平滑停止：先向 intake、compute、store 所在节点发送准备停顿，
    /// 再只向 intake 节点发送终止数据流。
    async fn gracefully_terminate_data_flow(
        &self,
        connection_id: &FeedConnectionId,
        retain_compute_partitions: Option<usize>,
    ) -> Result<(), FeedError> {
        let feed_id = &connection_id.feed_id;
        let intake = self.controller.intake_locations(feed_id).await?;
        let compute = self.controller.compute_locations(feed_id).await?;
        let store = self.controller.store_locations(connection_id).await?;
        let operator_locations: Vec<String> = intake
            .iter()
            .chain(compute.iter())
            .chain(store.iter())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.controller
            .run_message_job(
                ControlMessage::PrepareStall {
                    connection_id: connection_id.clone(),
                    retain_compute_partitions,
                },
                &operator_locations,
            )
            .await?;
        self.controller
            .run_message_job(
                ControlMessage::TerminateDataFlow {
                    connection_id: connection_id.clone(),
                },
                &intake,
            )
            .await
    }

    /// 依次处理报告通道中的消息，直到所有发送端关闭。
    pub async fn run(self: Arc<Self>, mut messages: mpsc::UnboundedReceiver<FeedMessage>) {
        info!("(LoadManager) 开始处理运行时报告");
        while let Some(message) = messages.recv().await {
            match message {
                FeedMessage::Congestion(report) => {
                    if let Err(e) = self.report_congestion(&report).await {
                        error!("(LoadManager) 处理拥塞报告失败: {}", e);
                    }
                }
                FeedMessage::ScaleIn(report) => {
                    if let Err(e) = self.submit_scale_in_report(&report).await {
                        error!("(LoadManager) 处理缩容建议失败: {}", e);
                    }
                }
                FeedMessage::Storage(report) => {
                    warn!(
                        "(LoadManager) {}[{}] 平均持久化延迟 {}ms 超出限制",
                        report.connection_id, report.partition, report.avg_delay_persistence_ms
                    );
                }
                FeedMessage::CommitAck(ack) => {
                    let mut acked = lock(&self.acked_bases);
                    let entry = acked
                        .entry((ack.connection_id.clone(), ack.intake_partition))
                        .or_insert(ack.base);
                    *entry = (*entry).max(ack.base);
                    debug!(
                        "(LoadManager) {} 分区 {} 窗口 {} 已确认",
                        ack.connection_id, ack.intake_partition, ack.base
                    );
                }
            }
        }
        info!("(LoadManager) 报告通道已关闭，停止");
    }
}

/// `ceil(n × inflow / outflow) + 1`。
fn required_cardinality(current: usize, inflow_rate: i64, outflow_rate: i64) -> usize {
    let ratio = (current as f64 * inflow_rate as f64) / outflow_rate as f64;
    ratio.ceil().max(0.0) as usize + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedRuntimeId, FeedRuntimeType};

    #[derive(Default)]
    struct MockController {
        compute: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
        fail_submit: bool,
    }

    impl MockController {
        fn with_compute(n: usize) -> Self {
            Self {
                compute: Mutex::new((0..n).map(|i| format!("nc{}", i)).collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            lock(&self.calls).clone()
        }

        fn record(&self, call: String) {
            lock(&self.calls).push(call);
        }
    }

    #[async_trait]
    impl JobController for MockController {
        async fn compute_locations(&self, _feed_id: &FeedId) -> Result<Vec<String>, FeedError> {
            Ok(lock(&self.compute).clone())
        }

        async fn intake_locations(&self, _feed_id: &FeedId) -> Result<Vec<String>, FeedError> {
            Ok(vec!["nc0".to_string()])
        }

        async fn store_locations(&self, _c: &FeedConnectionId) -> Result<Vec<String>, FeedError> {
            Ok(vec!["nc9".to_string()])
        }

        async fn nodes_for_substitution(&self, count: usize) -> Result<Vec<String>, FeedError> {
            Ok((0..count).map(|i| format!("helper{}", i)).collect())
        }

        async fn alter_compute_cardinality(
            &self,
            _c: &FeedConnectionId,
            cardinality: usize,
            locations: &[String],
        ) -> Result<(), FeedError> {
            self.record(format!("alter {} {:?}", cardinality, locations));
            Ok(())
        }

        async fn run_message_job(&self, message: ControlMessage, locations: &[String]) -> Result<(), FeedError> {
            let name = match message {
                ControlMessage::PrepareStall {
                    retain_compute_partitions,
                    ..
                } => format!("stall {:?}", retain_compute_partitions),
                ControlMessage::TerminateDataFlow { .. } => "terminate".to_string(),
            };
            self.record(format!("{} {:?}", name, locations));
            Ok(())
        }

        async fn submit_job(&self, _c: &FeedConnectionId) -> Result<(), FeedError> {
            if self.fail_submit {
                return Err(FeedError::Coordinator("提交失败".to_string()));
            }
            self.record("submit".to_string());
            Ok(())
        }
    }

    fn connection() -> FeedConnectionId {
        FeedConnectionId::new(FeedId::new("dv", "tweets"), "ds")
    }

    fn congestion(inflow: i64, outflow: i64) -> CongestionReport {
        let conn = connection();
        CongestionReport {
            runtime_id: FeedRuntimeId::new(FeedRuntimeType::Compute, conn.clone(), 0),
            connection_id: conn,
            inflow_rate: inflow,
            outflow_rate: outflow,
        }
    }

    #[test]
    fn test_required_cardinality() {
        assert_eq!(required_cardinality(2, 300, 100), 7);
        assert_eq!(required_cardinality(3, 100, 100), 4);
        assert_eq!(required_cardinality(4, 10, 100), 2);
    }

    /// 扩容流程：修改并行度，两阶段停止，稳定后重新提交；恢复期间的报告被忽略。
    #[tokio::test(start_paused = true)]
    async fn test_congestion_scales_out_once() {
        let controller = Arc::new(MockController::with_compute(2));
        let manager = FeedLoadManager::new(controller.clone(), &FeedConfig::default());
        manager.register_connection(connection());

        assert!(manager.report_congestion(&congestion(300, 100)).await.unwrap());
        assert_eq!(
            controller.calls(),
            vec![
                r#"alter 7 ["nc0", "nc1", "helper0", "helper1", "helper2", "helper3", "helper4"]"#.to_string(),
                r#"stall None ["nc0", "nc1", "nc9"]"#.to_string(),
                r#"terminate ["nc0"]"#.to_string(),
                "submit".to_string(),
            ]
        );
        assert_eq!(manager.job_state(&connection()), Some(FeedJobState::UnderRecovery));
        assert!(!manager.report_congestion(&congestion(300, 100)).await.unwrap());
        assert_eq!(controller.calls().len(), 4);

        manager.recovery_complete(&connection());
        assert_eq!(manager.job_state(&connection()), Some(FeedJobState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_in_ignored_for_unknown_or_recovering_connection() {
        let controller = Arc::new(MockController::with_compute(4));
        let manager = FeedLoadManager::new(controller.clone(), &FeedConfig::default());
        let report = ScaleInReport {
            connection_id: connection(),
            runtime_type: FeedRuntimeType::Compute,
            current_cardinality: 4,
            reduced_cardinality: 2,
        };
        assert!(!manager.submit_scale_in_report(&report).await.unwrap());

        manager.register_connection(connection());
        assert!(manager.submit_scale_in_report(&report).await.unwrap());
        assert!(!manager.submit_scale_in_report(&report).await.unwrap());
        assert_eq!(
            controller.calls(),
            vec![
                r#"alter 2 ["nc0", "nc1"]"#.to_string(),
                r#"stall Some(1) ["nc0", "nc1", "nc2", "nc3", "nc9"]"#.to_string(),
                r#"terminate ["nc0"]"#.to_string(),
                "submit".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_surfaces_and_resets_state() {
        let controller = Arc::new(MockController {
            fail_submit: true,
            ..MockController::with_compute(1)
        });
        let manager = FeedLoadManager::new(controller, &FeedConfig::default());
        manager.register_connection(connection());
        match manager.report_congestion(&congestion(500, 100)).await {
            Err(FeedError::Coordinator(_)) => {}
            other => panic!("期望 Coordinator 错误, 但得到 {:?}", other),
        }
        assert_eq!(manager.job_state(&connection()), Some(FeedJobState::Active));
        // 流出速率为 0 时无法计算，忽略
        assert!(!manager.report_congestion(&congestion(500, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_consumes_messages() {
        let controller = Arc::new(MockController::with_compute(1));
        let manager = Arc::new(FeedLoadManager::new(
            controller,
            &FeedConfig::default().with_settle_delay(Duration::ZERO),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(FeedMessage::CommitAck(crate::types::CommitAckMessage {
            connection_id: connection(),
            intake_partition: 0,
            base: 3,
            ack_info: bytes::Bytes::new(),
        }))
        .unwrap();
        tx.send(FeedMessage::Congestion(congestion(200, 100))).unwrap();
        drop(tx);
        Arc::clone(&manager).run(rx).await;
        assert_eq!(manager.max_acked_base(&connection(), 0), Some(3));
        assert_eq!(manager.job_state(&connection()), Some(FeedJobState::UnderRecovery));
    }
}
