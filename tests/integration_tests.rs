// /tests/integration_tests.rs

// 引入必要的依赖
// Add necessary dependencies
use async_trait::async_trait;
use bytes::Bytes;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::info;
// 日志记录 (Logging)

use feed_flow::{
    CollectorState, DistributionMode, DistributorError, DistributorHandle, FeedConfig,
    FeedConnectionId, FeedContext, FeedError, FeedId, FeedJobState, FeedLoadManager,
    FeedPolicyAccessor, FeedRuntimeId, FeedRuntimeKey, FeedRuntimeType, FrameCollector,
    FrameWriter, JobController, ControlMessage, ProcessingRateTask, RecordingWriter,
    RoutingMode, WriterLog, frame_from_tuples,
};

// 测试使用的帧大小 (Frame size used by the tests)
const FRAME_SIZE: usize = 64;

// 测试环境：上下文、分发器 Handle 和溢出目录 (Test environment: context, distributor handle and spill directory)
struct TestFeed {
    context: FeedContext,
    handle: DistributorHandle,
    connection: FeedConnectionId,
    _spill_dir: tempfile::TempDir,
}

impl TestFeed {
    fn new(config: FeedConfig) -> Self {
        Self::with_spill_path(config, |dir| dir.to_path_buf())
    }

    // 溢出目录由临时目录派生 (Spill directory derived from the temp dir)
    fn with_spill_path<F: FnOnce(&Path) -> PathBuf>(config: FeedConfig, spill_path: F) -> Self {
        let spill_dir = tempfile::tempdir().expect("创建临时目录失败 (Failed to create temp dir)");
        let config = config
            .with_frame_size(FRAME_SIZE)
            .with_spill_dir(spill_path(spill_dir.path()));
        let (context, _messages) = FeedContext::new(config);
        let feed = FeedId::new("it", "tweets");
        let key = FeedRuntimeKey::new(feed.clone(), FeedRuntimeType::Intake, 0);
        let handle = context.get_or_create_distributor(key);
        Self {
            context,
            handle,
            connection: FeedConnectionId::new(feed, "tweets_ds"),
            _spill_dir: spill_dir,
        }
    }

    // 为写入端创建收集器 (Create a collector for a writer)
    fn collector(&self, name: &str, writer: RecordingWriter, policy: FeedPolicyAccessor) -> FrameCollector {
        let runtime = FeedRuntimeId::new(FeedRuntimeType::Intake, self.connection.clone(), 0);
        FrameCollector::new(name, Box::new(writer), policy, self.context.monitor_context(runtime))
    }

    async fn register(&self, name: &str, writer: RecordingWriter, policy: FeedPolicyAccessor) -> DistributionMode {
        self.handle
            .register(self.collector(name, writer, policy))
            .await
            .expect("注册应成功 (Register should succeed)")
    }

    async fn push(&self, tags: std::ops::Range<u32>) {
        for tag in tags {
            self.handle
                .next_frame(frame(tag))
                .await
                .expect("next_frame 应成功 (next_frame should succeed)");
        }
    }
}

// 每帧一个元组，内容是帧序号 (One tuple per frame holding the frame number)
fn frame(tag: u32) -> Bytes {
    let bytes = tag.to_be_bytes();
    frame_from_tuples(FRAME_SIZE, [&bytes[..]]).expect("构造帧失败 (Failed to build frame)")
}

fn tags(log: &WriterLog) -> Vec<u32> {
    log.tuples()
        .iter()
        .map(|t| u32::from_be_bytes([t[0], t[1], t[2], t[3]]))
        .collect()
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).expect("容量必须大于 0 (Capacity must be non-zero)")
}

fn spill_policy() -> FeedPolicyAccessor {
    FeedPolicyAccessor::default().with_spill_to_disk(true)
}

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("等待超时 (Timed out waiting for): {}", what));
}

// 测试1：分发模式始终与收集器数量一致 (Test 1: Distribution mode always matches collector count)
#[tokio::test]
async fn test_mode_consistency_across_topology_changes() {
    let feed = TestFeed::new(FeedConfig::default());
    let h = &feed.handle;
    assert_eq!(h.distribution_mode().await.unwrap(), DistributionMode::Inactive);

    let mut expected = 0usize;
    for name in ["a", "b", "c"] {
        let (writer, _) = RecordingWriter::new(name);
        let mode = feed.register(name, writer, FeedPolicyAccessor::default()).await;
        expected += 1;
        assert_eq!(mode, DistributionMode::for_collector_count(expected));
        assert_eq!(h.status().await.unwrap().collectors.len(), expected);
    }

    // 重复注册 (Duplicate registration)
    let (dup, _) = RecordingWriter::new("a");
    match h.register(feed.collector("a", dup, FeedPolicyAccessor::default())).await {
        Err(FeedError::Distributor(DistributorError::AlreadyRegistered(id))) => assert_eq!(id, "a"),
        other => panic!("期望 AlreadyRegistered (Expected AlreadyRegistered), 得到 {:?}", other),
    }

    for name in ["b", "a", "c"] {
        let mode = h.deregister(name).await.unwrap();
        expected -= 1;
        assert_eq!(mode, DistributionMode::for_collector_count(expected));
        assert_eq!(h.status().await.unwrap().collectors.len(), expected);
        assert!(!h.is_registered(name).await.unwrap());
    }

    match h.deregister("a").await {
        Err(FeedError::Distributor(DistributorError::InvalidDeregistration(mode))) => {
            assert_eq!(mode, DistributionMode::Inactive)
        }
        other => panic!("期望 InvalidDeregistration (Expected InvalidDeregistration), 得到 {:?}", other),
    }

    let (writer, _) = RecordingWriter::new("z");
    feed.register("z", writer, FeedPolicyAccessor::default()).await;
    match h.deregister("ghost").await {
        Err(FeedError::Distributor(DistributorError::NotRegistered(id))) => assert_eq!(id, "ghost"),
        other => panic!("期望 NotRegistered (Expected NotRegistered), 得到 {:?}", other),
    }
    assert_eq!(h.distribution_mode().await.unwrap(), DistributionMode::Single);
}

// 测试2：关闭时不丢帧，快慢收集器都按原顺序收到全部帧
// (Test 2: No frames lost on close; fast and slow collectors both see every frame in order)
#[tokio::test]
async fn test_no_lost_frames_on_drain() {
    let feed = TestFeed::new(FeedConfig::default().with_pool_capacity(capacity(4)));
    let gate = Arc::new(Semaphore::new(0));
    let (fast, fast_log) = RecordingWriter::new("fast");
    let (slow, slow_log) = RecordingWriter::new("slow");
    feed.register("fast", fast, FeedPolicyAccessor::default()).await;
    feed.register("slow", slow.with_gate(gate.clone()), spill_policy()).await;

    feed.push(0..30).await;
    let status = feed.handle.status().await.unwrap();
    info!("关闭前状态 (Status before close): {:?}", status);
    assert_eq!(status.routing_mode, Some(RoutingMode::SpillToDisk));
    assert_eq!(status.spilled_frames, 26, "池中 4 帧，其余溢出 (4 frames pooled, the rest spilled)");

    gate.add_permits(1000);
    let final_status = feed.handle.close().await.unwrap();

    let expected: Vec<u32> = (0..30).collect();
    assert_eq!(tags(&fast_log), expected);
    assert_eq!(tags(&slow_log), expected);
    assert!(fast_log.is_closed() && slow_log.is_closed());
    assert_eq!(final_status.distribution_mode, Some(DistributionMode::Inactive));
    assert!(final_status
        .collectors
        .iter()
        .all(|c| c.state == CollectorState::Finished));
    assert_eq!(final_status.pending_spilled_frames, 0);
    assert_eq!(final_status.replayed_frames, 26);
}

// 测试3：bucket 只在所有读者完成后才被复用，内容不会被覆盖
// (Test 3: Buckets are reused only after every reader is done; contents are never overwritten)
#[tokio::test]
async fn test_bucket_recycling_keeps_contents_intact() {
    let feed = TestFeed::new(FeedConfig::default().with_pool_capacity(capacity(2)));
    let mut logs = Vec::new();
    for (i, name) in ["r0", "r1", "r2"].into_iter().enumerate() {
        let (writer, log) = RecordingWriter::new(name);
        let writer = writer.with_delay(Duration::from_millis(i as u64));
        feed.register(name, writer, spill_policy()).await;
        logs.push(log);
    }
    feed.push(0..50).await;
    feed.handle.close().await.unwrap();

    let expected: Vec<u32> = (0..50).collect();
    for log in &logs {
        assert_eq!(tags(log), expected);
    }
    let memory = feed.context.memory_manager();
    assert_eq!(memory.acquisitions(), 1);
    assert_eq!(memory.outstanding(), 0);
}

// 测试4：溢出的帧总是先于之后的帧被观察到 (Test 4: Spilled frames are always observed before later frames)
#[tokio::test]
async fn test_spill_ordering_with_incremental_replay() {
    let feed = TestFeed::new(
        FeedConfig::default()
            .with_pool_capacity(capacity(2))
            .with_short_circuit(false),
    );
    let gate = Arc::new(Semaphore::new(0));
    let (writer, log) = RecordingWriter::new("only");
    feed.register("only", writer.with_gate(gate.clone()), spill_policy()).await;

    // F0、F1 占满缓冲池，F2..F9 溢出 (F0, F1 fill the pool; F2..F9 spill)
    feed.push(0..10).await;
    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.routing_mode, Some(RoutingMode::SpillToDisk));
    assert_eq!(status.pending_spilled_frames, 8);

    // 放行两帧后，下一帧先触发回放 (After two frames drain, the next frame first triggers replay)
    gate.add_permits(2);
    wait_until(|| log.frame_count() == 2, "前两帧被写入 (first two frames written)").await;
    let handle = feed.handle.clone();
    wait_until_pool_idle(&handle).await;
    feed.push(10..11).await;
    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.replayed_frames, 2);
    assert_eq!(status.pending_spilled_frames, 7, "F10 排在剩余溢出帧之后 (F10 queued behind the remaining spill)");

    // 全部放行，持续推送直到回到内存路由 (Open the gate and keep pushing until routing returns to memory)
    gate.add_permits(1000);
    let mut next = 11;
    while feed.handle.routing_mode().await.unwrap() != RoutingMode::InMemoryRoute {
        wait_until_pool_idle(&handle).await;
        feed.push(next..next + 1).await;
        next += 1;
    }
    feed.handle.close().await.unwrap();
    let expected: Vec<u32> = (0..next).collect();
    assert_eq!(tags(&log), expected);
}

async fn wait_until_pool_idle(handle: &DistributorHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = handle.status().await.unwrap();
            if status.pool_available == status.pool_capacity {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("缓冲池应变为空闲 (Pool should become idle)");
}

async fn wait_for_state(handle: &DistributorHandle, writer_id: &str, state: CollectorState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = handle.status().await.unwrap();
            if status.collector(writer_id).map(|c| c.state) == Some(state) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} 未进入 {} (did not reach state)", writer_id, state));
}

// 测试5：拥塞时调用者永不阻塞 (Test 5: The caller never blocks under congestion)
#[tokio::test]
async fn test_congestion_fallback_never_blocks() {
    let feed = TestFeed::new(FeedConfig::default().with_pool_capacity(capacity(2)));
    let gate = Arc::new(Semaphore::new(0));
    let (a, a_log) = RecordingWriter::new("a");
    let (b, b_log) = RecordingWriter::new("b");
    feed.register("a", a.with_gate(gate.clone()), FeedPolicyAccessor::default()).await;
    feed.register("b", b.with_gate(gate.clone()), FeedPolicyAccessor::default()).await;

    for tag in 0..20 {
        let routed = tokio::time::timeout(Duration::from_secs(1), feed.handle.next_frame(frame(tag)))
            .await
            .expect("next_frame 不应阻塞 (next_frame must not block)")
            .unwrap();
        if tag >= 2 {
            assert_eq!(routed, RoutingMode::Discard);
        }
    }
    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.discarded_frames, 18);

    gate.add_permits(1000);
    feed.handle.close().await.unwrap();
    assert_eq!(tags(&a_log), vec![0, 1]);
    assert_eq!(tags(&b_log), vec![0, 1]);
}

// 测试6：容量为 2 的缓冲池，两个未排空的收集器，第三帧被丢弃
// (Test 6: Pool of capacity 2, two idle collectors, the third frame is discarded)
#[tokio::test]
async fn test_capacity_two_discard_scenario() {
    let feed = TestFeed::new(FeedConfig::default().with_pool_capacity(capacity(2)));
    let gate = Arc::new(Semaphore::new(0));
    let (a, a_log) = RecordingWriter::new("a");
    let (b, b_log) = RecordingWriter::new("b");
    feed.register("a", a.with_gate(gate.clone()), FeedPolicyAccessor::default()).await;
    assert_eq!(
        feed.register("b", b.with_gate(gate.clone()), FeedPolicyAccessor::default()).await,
        DistributionMode::Shared
    );

    feed.push(1..4).await;
    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.in_memory_frames, 2);
    assert_eq!(status.discarded_frames, 1);
    assert_eq!(status.routing_mode, Some(RoutingMode::Discard));
    assert!(status.summaries.iter().any(|s| s.contains("累计丢弃 1 帧")));

    gate.add_permits(10);
    feed.handle.close().await.unwrap();
    assert_eq!(tags(&a_log), vec![1, 2]);
    assert_eq!(tags(&b_log), vec![1, 2]);
}

// 测试7：先 A 后 B 注册，两者都有工作任务，缓冲池只获取一次
// (Test 7: Register A then B; both have workers and the pool is acquired exactly once)
#[tokio::test]
async fn test_register_a_then_b_acquires_pool_once() {
    for short_circuit in [true, false] {
        let feed = TestFeed::new(FeedConfig::default().with_short_circuit(short_circuit));
        let (a, _) = RecordingWriter::new("a");
        let (b, _) = RecordingWriter::new("b");
        assert_eq!(
            feed.register("a", a, FeedPolicyAccessor::default()).await,
            DistributionMode::Single
        );
        let status = feed.handle.status().await.unwrap();
        assert_eq!(status.collector("a").unwrap().worker_running, !short_circuit);

        assert_eq!(
            feed.register("b", b, FeedPolicyAccessor::default()).await,
            DistributionMode::Shared
        );
        let status = feed.handle.status().await.unwrap();
        assert!(status.collector("a").unwrap().worker_running);
        assert!(status.collector("b").unwrap().worker_running);
        assert!(status.pool_capacity.is_some());
        assert_eq!(feed.context.memory_manager().acquisitions(), 1);
        feed.handle.close().await.unwrap();
        assert_eq!(feed.context.memory_manager().releases(), 1);
    }
}

// 测试8：缩容建议在并行度改变前只提出一次，协调器在恢复期间忽略重复报告
// (Test 8: A scale-in proposal is emitted once per cardinality; the coordinator ignores repeats during recovery)
#[derive(Default)]
struct CountingController {
    submits: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl JobController for CountingController {
    async fn compute_locations(&self, _f: &FeedId) -> Result<Vec<String>, FeedError> {
        Ok((0..4).map(|i| format!("nc{}", i)).collect())
    }
    async fn intake_locations(&self, _f: &FeedId) -> Result<Vec<String>, FeedError> {
        Ok(vec!["nc0".to_string()])
    }
    async fn store_locations(&self, _c: &FeedConnectionId) -> Result<Vec<String>, FeedError> {
        Ok(vec!["nc0".to_string()])
    }
    async fn nodes_for_substitution(&self, count: usize) -> Result<Vec<String>, FeedError> {
        Ok(vec!["spare".to_string(); count])
    }
    async fn alter_compute_cardinality(&self, _c: &FeedConnectionId, _n: usize, _l: &[String]) -> Result<(), FeedError> {
        Ok(())
    }
    async fn run_message_job(&self, _m: ControlMessage, _l: &[String]) -> Result<(), FeedError> {
        Ok(())
    }
    async fn submit_job(&self, _c: &FeedConnectionId) -> Result<(), FeedError> {
        self.submits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_scale_in_idempotence_end_to_end() {
    let connection = FeedConnectionId::new(FeedId::new("it", "tweets"), "tweets_ds");
    let runtime = FeedRuntimeId::new(FeedRuntimeType::Compute, connection.clone(), 0);
    let controller = Arc::new(CountingController::default());
    let manager = FeedLoadManager::new(controller.clone(), &FeedConfig::default());
    manager.register_connection(connection.clone());

    let mut task = ProcessingRateTask::new(connection.clone(), runtime, 4, None);
    let report = task.run(100, 400).expect("应提出缩容建议 (Should propose scale-in)");
    assert!(manager.submit_scale_in_report(&report).await.unwrap());
    assert_eq!(manager.job_state(&connection), Some(FeedJobState::UnderRecovery));

    // 触发条件持续存在，但不会再次提出 (The condition persists but no second proposal is emitted)
    for _ in 0..5 {
        assert!(task.run(100, 400).is_none());
    }
    // 即使重复提交同一报告也被忽略 (Even a resubmitted report is ignored)
    assert!(!manager.submit_scale_in_report(&report).await.unwrap());
    assert_eq!(controller.submits.load(std::sync::atomic::Ordering::SeqCst), 1);

    manager.recovery_complete(&connection);
    task.set_number_of_partitions(report.reduced_cardinality);
    assert_eq!(task.number_of_partitions(), 1);
    assert!(task.run(100, 400).is_none(), "并行度为 1 时无法再缩 (Cannot shrink below 1)");
}

// 测试9：SHARED -> SINGLE 时幸存者先排空再恢复短路交付
// (Test 9: On SHARED -> SINGLE the survivor drains before short-circuit delivery resumes)
#[tokio::test]
async fn test_transition_drains_then_short_circuits() {
    let feed = TestFeed::new(FeedConfig::default());
    let gate = Arc::new(Semaphore::new(0));
    let (a, a_log) = RecordingWriter::new("a");
    let (b, b_log) = RecordingWriter::new("b");
    feed.register("a", a.with_gate(gate.clone()), FeedPolicyAccessor::default()).await;
    feed.register("b", b, FeedPolicyAccessor::default()).await;
    feed.push(0..5).await;

    assert_eq!(feed.handle.deregister("b").await.unwrap(), DistributionMode::Single);
    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.collector("a").unwrap().state, CollectorState::Transition);

    // 幸存者仍有积压，新帧继续经由缓冲池 (The survivor has a backlog, so new frames still go through the pool)
    feed.push(5..8).await;
    assert_eq!(feed.handle.status().await.unwrap().short_circuit_frames, 0);

    gate.add_permits(1000);
    wait_until(|| a_log.frame_count() == 8, "幸存者排空积压 (survivor drains its backlog)").await;
    let handle = feed.handle.clone();
    wait_until_pool_idle(&handle).await;
    feed.push(8..10).await;

    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.collector("a").unwrap().state, CollectorState::Active);
    assert_eq!(status.short_circuit_frames, 2);
    assert_eq!(status.pool_capacity, None, "短路时归还缓冲池 (Pool released when short-circuiting)");
    assert_eq!(feed.context.memory_manager().releases(), 1);

    feed.handle.close().await.unwrap();
    assert_eq!(tags(&a_log), (0..10).collect::<Vec<_>>());
    wait_until(|| b_log.is_closed(), "退订者处理完结束标记 (departed collector processed EOD)").await;
    assert_eq!(tags(&b_log), (0..5).collect::<Vec<_>>());
}

// 测试10：数据流结束标记排在之前的帧之后 (Test 10: The end-of-feed marker follows all earlier frames)
#[tokio::test]
async fn test_end_of_feed_after_data() {
    let feed = TestFeed::new(FeedConfig::default());
    let (a, a_log) = RecordingWriter::new("a");
    let (b, b_log) = RecordingWriter::new("b");
    feed.register("a", a.with_delay(Duration::from_millis(2)), FeedPolicyAccessor::default()).await;
    feed.register("b", b, FeedPolicyAccessor::default()).await;
    feed.push(0..10).await;
    feed.handle.notify_end_of_feed().await.unwrap();

    wait_until(|| a_log.is_closed() && b_log.is_closed(), "两个写入端关闭 (both writers closed)").await;
    assert_eq!(a_log.frame_count(), 10);
    assert_eq!(b_log.frame_count(), 10);
    let status = feed.handle.status().await.unwrap();
    assert!(status.collectors.iter().all(|c| c.state == CollectorState::Finished));
    feed.handle.close().await.unwrap();
    assert_eq!(a_log.close_count(), 1, "写入端只关闭一次 (Writer closed exactly once)");
}

// 测试11：元组级错误经切片后恢复，不可恢复的错误只结束对应的收集器
// (Test 11: Tuple-level errors recover by slicing; fatal errors finish only that collector)
#[tokio::test]
async fn test_soft_and_fatal_failures() {
    let feed = TestFeed::new(FeedConfig::default());
    let (picky, picky_log) = RecordingWriter::new("picky");
    let picky = picky.reject_tuples_where(|t| t == b"bad");
    feed.register("picky", picky, FeedPolicyAccessor::default()).await;

    let mixed = frame_from_tuples(FRAME_SIZE, [&b"ok1"[..], &b"bad"[..], &b"ok2"[..]])
        .expect("构造帧失败 (Failed to build frame)");
    feed.handle.next_frame(mixed).await.unwrap();
    assert_eq!(picky_log.tuples(), vec![b"ok2".to_vec()]);

    let (broken, broken_log) = RecordingWriter::new("broken");
    feed.register("broken", broken.with_fatal_error_at(1), FeedPolicyAccessor::default()).await;
    feed.push(0..3).await;
    wait_for_state(&feed.handle, "broken", CollectorState::Finished).await;
    assert!(broken_log.is_failed(), "写入端应收到失败通知 (Writer should be failed)");

    let final_status = feed.handle.close().await.unwrap();
    assert_eq!(picky_log.frame_count(), 4);
    assert!(!broken_log.is_closed());
    assert_eq!(final_status.collectors.len(), 2);
}

// 注册时打开写入端失败 (Writer open failure on registration)
struct UnopenableWriter;

#[async_trait]
impl FrameWriter for UnopenableWriter {
    async fn open(&mut self) -> Result<(), FeedError> {
        Err(FeedError::Writer("无法连接 (cannot connect)".to_string()))
    }
    async fn next_frame(&mut self, _frame: &Bytes) -> Result<(), FeedError> {
        Ok(())
    }
    async fn close(&mut self) -> Result<(), FeedError> {
        Ok(())
    }
    async fn fail(&mut self) -> Result<(), FeedError> {
        Ok(())
    }
}

// 测试12：打开失败的写入端不会被注册，关闭后的请求失败
// (Test 12: A writer that fails to open is not registered; requests after close fail)
#[tokio::test]
async fn test_open_failure_and_requests_after_close() {
    let feed = TestFeed::new(FeedConfig::default());
    let runtime = FeedRuntimeId::new(FeedRuntimeType::Intake, feed.connection.clone(), 0);
    let collector = FrameCollector::new(
        "remote",
        Box::new(UnopenableWriter),
        FeedPolicyAccessor::default(),
        feed.context.monitor_context(runtime),
    );
    match feed.handle.register(collector).await {
        Err(FeedError::Distributor(DistributorError::WriterOpenFailed { writer_id, .. })) => {
            assert_eq!(writer_id, "remote")
        }
        other => panic!("期望 WriterOpenFailed (Expected WriterOpenFailed), 得到 {:?}", other),
    }
    assert_eq!(feed.handle.distribution_mode().await.unwrap(), DistributionMode::Inactive);

    // INACTIVE 时帧被直接丢弃 (Frames are dropped while INACTIVE)
    assert_eq!(feed.handle.next_frame(frame(0)).await.unwrap(), RoutingMode::InMemoryRoute);

    let status = feed.handle.close().await.unwrap();
    assert!(status.collectors.is_empty());
    match feed.handle.next_frame(frame(1)).await {
        Err(FeedError::SendRequestError(_))
        | Err(FeedError::ReceiveReplyError(_))
        | Err(FeedError::Distributor(DistributorError::Closed)) => {}
        other => panic!("关闭后请求应失败 (Requests after close should fail), 得到 {:?}", other),
    }
}

// 测试13：长度与配置不符的帧被拒绝，不会交给任何写入端
// (Test 13: Frames whose length differs from the configured size are rejected and reach no writer)
#[tokio::test]
async fn test_wrong_size_frame_is_rejected() {
    let feed = TestFeed::new(FeedConfig::default());
    let (a, a_log) = RecordingWriter::new("a");
    let (b, b_log) = RecordingWriter::new("b");
    feed.register("a", a, FeedPolicyAccessor::default()).await;

    match feed.handle.next_frame(Bytes::from_static(b"abc")).await {
        Err(FeedError::Distributor(DistributorError::InvalidFrameSize { expected, actual })) => {
            assert_eq!((expected, actual), (FRAME_SIZE, 3))
        }
        other => panic!("期望 InvalidFrameSize (Expected InvalidFrameSize), 得到 {:?}", other),
    }
    assert_eq!(a_log.frame_count(), 0);

    // SHARED 模式下同样拒绝 (Also rejected in SHARED mode)
    feed.register("b", b, FeedPolicyAccessor::default()).await;
    let oversized = Bytes::from(vec![0u8; FRAME_SIZE + 1]);
    assert!(feed.handle.next_frame(oversized).await.is_err());

    feed.push(0..1).await;
    feed.handle.close().await.unwrap();
    assert_eq!(tags(&a_log), vec![0]);
    assert_eq!(tags(&b_log), vec![0]);
}

// 测试14：溢出日志无法创建时错误返回给调用者，分发器仍可查询和关闭
// (Test 14: A spill log that cannot be created surfaces an error; the distributor still answers and closes)
#[tokio::test]
async fn test_spill_io_failure_surfaces() {
    let feed = TestFeed::with_spill_path(
        FeedConfig::default()
            .with_pool_capacity(capacity(1))
            .with_short_circuit(false),
        |dir| {
            // 普通文件下的目录无法创建 (A directory below a regular file cannot be created)
            let blocker = dir.join("blocker");
            std::fs::write(&blocker, b"not a directory").expect("写入文件失败 (Failed to write file)");
            blocker.join("spill")
        },
    );
    let gate = Arc::new(Semaphore::new(0));
    let (writer, log) = RecordingWriter::new("slow");
    feed.register("slow", writer.with_gate(gate.clone()), spill_policy()).await;

    feed.push(0..1).await;
    match feed.handle.next_frame(frame(1)).await {
        Err(FeedError::Distributor(DistributorError::SpillIo(message))) => {
            info!("溢出失败 (Spill failed): {}", message)
        }
        other => panic!("期望 SpillIo (Expected SpillIo), 得到 {:?}", other),
    }
    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.routing_mode, Some(RoutingMode::SpillToDisk));
    assert_eq!(status.pending_spilled_frames, 0);

    gate.add_permits(1000);
    let final_status = tokio::time::timeout(Duration::from_secs(5), feed.handle.close())
        .await
        .expect("关闭不应挂起 (Close must not hang)")
        .unwrap();
    assert_eq!(final_status.distribution_mode, Some(DistributionMode::Inactive));
    assert_eq!(tags(&log), vec![0]);
}

// 测试15：容量为 1 的缓冲池，关闭时阻塞式回放等待槽位归还后完成
// (Test 15: With a pool of capacity 1, the blocking replay on close waits for the slot and finishes)
#[tokio::test]
async fn test_single_slot_pool_drains_spill_on_close() {
    let feed = TestFeed::new(
        FeedConfig::default()
            .with_pool_capacity(capacity(1))
            .with_short_circuit(false),
    );
    let gate = Arc::new(Semaphore::new(0));
    let (writer, log) = RecordingWriter::new("only");
    feed.register("only", writer.with_gate(gate.clone()), spill_policy()).await;
    feed.push(0..6).await;
    assert_eq!(feed.handle.status().await.unwrap().pending_spilled_frames, 5);

    // 关闭开始后才放行写入端 (Release the writer only after close has started)
    let opener = {
        let gate = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.add_permits(1000);
        })
    };
    let status = tokio::time::timeout(Duration::from_secs(5), feed.handle.close())
        .await
        .expect("关闭不应挂起 (Close must not hang)")
        .unwrap();
    opener.await.unwrap();
    assert_eq!(status.replayed_frames, 5);
    assert_eq!(tags(&log), (0..6).collect::<Vec<_>>());
    assert!(log.is_closed());
}

// 测试16：幸存者正在处理最后一帧时，新帧仍经由缓冲池且调用者不被阻塞
// (Test 16: While the survivor is still writing its last queued frame, new frames go through the pool without blocking)
#[tokio::test]
async fn test_transition_waits_for_in_flight_frame() {
    let feed = TestFeed::new(FeedConfig::default());
    let gate = Arc::new(Semaphore::new(0));
    let (a, a_log) = RecordingWriter::new("a");
    let (b, _) = RecordingWriter::new("b");
    feed.register("a", a.with_gate(gate.clone()), FeedPolicyAccessor::default()).await;
    feed.register("b", b, FeedPolicyAccessor::default()).await;
    feed.push(0..5).await;
    assert_eq!(feed.handle.deregister("b").await.unwrap(), DistributionMode::Single);

    // 放行 4 帧，第 5 帧已出队但阻塞在写入端 (Release 4 frames; the 5th is dequeued but blocked in the writer)
    gate.add_permits(4);
    wait_until(|| a_log.frame_count() == 4, "前四帧被写入 (first four frames written)").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let routed = tokio::time::timeout(Duration::from_secs(1), feed.handle.next_frame(frame(5)))
        .await
        .expect("next_frame 不应等待写入端 (next_frame must not wait for the writer)")
        .unwrap();
    assert_eq!(routed, RoutingMode::InMemoryRoute);
    let status = feed.handle.status().await.unwrap();
    assert_eq!(status.short_circuit_frames, 0);
    assert_eq!(status.collector("a").unwrap().state, CollectorState::Transition);

    gate.add_permits(1000);
    feed.handle.close().await.unwrap();
    assert_eq!(tags(&a_log), (0..6).collect::<Vec<_>>());
}
