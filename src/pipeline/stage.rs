//! 流水线阶段: 输入环形缓冲区 → 工作线程 → 结果环形缓冲区
//!
//! 状态机: `Created → Running → StopRequested → Stopped`.
//! [`PipelineStage`] 处于 Created, [`PipelineStage::start`] 之后由 [`StageHandle`] 持有;
//! `StageHandle` 销毁时先停止再 join, 线程不会比缓冲区活得更久.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::{Frame, StageKind, StagePayload, StageResult};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::ring_buffer::{Consumer, Producer, RingBuffer};

/// 结果缓冲区已满时, 发布重试的间隔
const PUBLISH_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    Created = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl StageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StageState::Created,
            1 => StageState::Running,
            2 => StageState::StopRequested,
            _ => StageState::Stopped,
        }
    }
}

/// 阶段的具体工作: 每帧调用一次, 只在阶段线程上运行
pub trait StageWorker: Send + 'static {
    fn process(&mut self, frame: &Frame) -> Result<StagePayload, PipelineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOptions {
    pub input_capacity: usize,
    pub result_capacity: usize,
    pub publish_timeout: Duration,
}

impl StageOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            input_capacity: config.input_capacity,
            result_capacity: config.result_capacity,
            publish_timeout: config.publish_timeout(),
        }
    }

    /// 图像服务: 回执缓冲区满时立即丢弃
    pub fn for_service(config: &PipelineConfig) -> Self {
        Self {
            input_capacity: config.input_capacity,
            result_capacity: config.service_result_capacity,
            publish_timeout: Duration::ZERO,
        }
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[derive(Debug, Default)]
struct StageStats {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped_results: AtomicU64,
    released_frames: AtomicU64,
    released_results: AtomicU64,
}

/// 阶段统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
    pub stage: StageKind,
    pub processed: u64,
    pub failed: u64,
    pub dropped_results: u64,
    pub released_frames: u64,
    pub released_results: u64,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: processed={} failed={} dropped_results={} released_frames={} released_results={}",
            self.stage,
            self.processed,
            self.failed,
            self.dropped_results,
            self.released_frames,
            self.released_results
        )
    }
}

/// 条件变量 + 互斥锁; 通知在锁内发出, 避免丢失唤醒
#[derive(Default)]
struct Signal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

struct StageShared {
    kind: StageKind,
    state: AtomicU8,
    input_ready: Signal,
    result_ready: Signal,
    stats: StageStats,
}

impl StageShared {
    fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.state() == StageState::Running
    }

    fn report(&self) -> StageReport {
        let s = &self.stats;
        StageReport {
            stage: self.kind,
            processed: s.processed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            dropped_results: s.dropped_results.load(Ordering::Relaxed),
            released_frames: s.released_frames.load(Ordering::Relaxed),
            released_results: s.released_results.load(Ordering::Relaxed),
        }
    }
}

/// 已创建、尚未启动的阶段
pub struct PipelineStage<W: StageWorker> {
    worker: W,
    options: StageOptions,
    shared: Arc<StageShared>,
    input: RingBuffer<Frame>,
    results: RingBuffer<StageResult>,
}

impl<W: StageWorker> PipelineStage<W> {
    /// # Panics
    /// 缓冲区容量小于 2 时 panic; 容量应先经 [`PipelineConfig::validate`] 检查.
    pub fn new(kind: StageKind, worker: W, options: StageOptions) -> Self {
        let shared = Arc::new(StageShared {
            kind,
            state: AtomicU8::new(StageState::Created as u8),
            input_ready: Signal::default(),
            result_ready: Signal::default(),
            stats: StageStats::default(),
        });

        let on_frame = Arc::clone(&shared);
        let input = RingBuffer::with_release(options.input_capacity, move |frame: Frame| {
            on_frame.stats.released_frames.fetch_add(1, Ordering::Relaxed);
            debug!(stage = %on_frame.kind, session = frame.session, "释放未处理的帧");
        });
        let on_result = Arc::clone(&shared);
        let results = RingBuffer::with_release(options.result_capacity, move |r: StageResult| {
            on_result.stats.released_results.fetch_add(1, Ordering::Relaxed);
            debug!(stage = %on_result.kind, session = r.session, "释放未读取的结果");
        });

        Self {
            worker,
            options,
            shared,
            input,
            results,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.shared.kind
    }

    pub fn state(&self) -> StageState {
        self.shared.state()
    }

    /// 启动工作线程
    pub fn start(self) -> Result<StageHandle, PipelineError> {
        let PipelineStage {
            worker,
            options,
            shared,
            input,
            results,
        } = self;
        let kind = shared.kind;
        let (input_tx, input_rx) = input.split();
        let (result_tx, result_rx) = results.split();

        shared.set_state(StageState::Running);
        let thread_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("netra-{kind}"))
            .spawn(move || run_stage(worker, input_rx, result_tx, thread_shared, options));

        match spawned {
            Ok(thread) => Ok(StageHandle {
                shared,
                input: Some(input_tx),
                results: Some(result_rx),
                thread: Some(thread),
            }),
            Err(e) => {
                shared.set_state(StageState::Stopped);
                Err(PipelineError::Configuration(format!(
                    "failed to spawn {kind} stage thread: {e}"
                )))
            }
        }
    }
}

fn run_stage<W: StageWorker>(
    mut worker: W,
    mut input: Consumer<Frame>,
    mut results: Producer<StageResult>,
    shared: Arc<StageShared>,
    options: StageOptions,
) {
    let kind = shared.kind;
    info!(stage = %kind, "阶段线程启动");

    loop {
        {
            let mut guard = shared.input_ready.lock.lock();
            while input.is_empty() && shared.is_running() {
                shared.input_ready.cond.wait(&mut guard);
            }
        }
        if !shared.is_running() {
            break;
        }

        // 逐帧处理, 观察到停止请求后不再取新帧
        while shared.is_running() {
            let Some(frame) = input.pop() else {
                break;
            };
            let session = frame.session;
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| worker.process(&frame))) {
                Ok(outcome) => outcome,
                Err(payload) => Err(PipelineError::Detection(format!(
                    "{kind} worker panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            drop(frame);

            shared.stats.processed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = &outcome {
                shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(stage = %kind, session, error = %e, "帧处理失败");
            } else {
                trace!(stage = %kind, session, "帧处理完成");
            }

            publish(
                &mut results,
                StageResult {
                    session,
                    stage: kind,
                    outcome,
                },
                &shared,
                options.publish_timeout,
            );
        }
    }

    info!(stage = %kind, "阶段线程退出");
}

/// 发布结果; 缓冲区满时最多等待 `timeout`, 期间收到停止请求也放弃
fn publish(
    results: &mut Producer<StageResult>,
    mut result: StageResult,
    shared: &StageShared,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        match results.push(result) {
            Ok(()) => {
                shared.result_ready.notify();
                return;
            }
            Err(back) => {
                if !shared.is_running() || Instant::now() >= deadline {
                    shared.stats.dropped_results.fetch_add(1, Ordering::Relaxed);
                    warn!(stage = %shared.kind, session = back.session, "结果缓冲区已满, 丢弃结果");
                    return;
                }
                result = back;
                thread::sleep(PUBLISH_RETRY_INTERVAL);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// 运行中的阶段 (调用方一侧的缓冲区端点 + 线程句柄)
pub struct StageHandle {
    shared: Arc<StageShared>,
    input: Option<Producer<Frame>>,
    results: Option<Consumer<StageResult>>,
    thread: Option<JoinHandle<()>>,
}

impl StageHandle {
    pub fn kind(&self) -> StageKind {
        self.shared.kind
    }

    pub fn state(&self) -> StageState {
        self.shared.state()
    }

    pub fn report(&self) -> StageReport {
        self.shared.report()
    }

    /// 非阻塞提交; 缓冲区满或阶段已停止时原样返回帧
    pub fn submit(&mut self, frame: Frame) -> Result<(), Frame> {
        if !self.shared.is_running() {
            return Err(frame);
        }
        let Some(input) = self.input.as_mut() else {
            return Err(frame);
        };
        input.push(frame)?;
        self.shared.input_ready.notify();
        Ok(())
    }

    pub fn try_result(&mut self) -> Option<StageResult> {
        self.results.as_mut()?.pop()
    }

    /// 等待下一个结果直到 `deadline`
    pub fn wait_result(&mut self, deadline: Instant) -> Option<StageResult> {
        let results = self.results.as_mut()?;
        loop {
            if let Some(result) = results.pop() {
                return Some(result);
            }
            let mut guard = self.shared.result_ready.lock.lock();
            if !results.is_empty() {
                continue;
            }
            if !self.shared.is_running() || Instant::now() >= deadline {
                return None;
            }
            self.shared
                .result_ready
                .cond
                .wait_until(&mut guard, deadline);
        }
    }

    /// 停止并 join; 剩余帧与结果经释放策略计数. 可重复调用.
    pub fn stop(&mut self) -> StageReport {
        if let Some(thread) = self.thread.take() {
            self.shared.set_state(StageState::StopRequested);
            self.shared.input_ready.notify();
            if thread.join().is_err() {
                error!(stage = %self.shared.kind, "阶段线程异常退出");
            }
        }
        // 线程已退出, 丢弃最后的端点即销毁缓冲区
        self.input.take();
        self.results.take();
        self.shared.set_state(StageState::Stopped);

        let report = self.shared.report();
        info!(stage = %self.shared.kind, %report, "阶段已停止");
        report
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        if self.thread.is_some() || self.input.is_some() {
            self.stop();
        }
    }
}

impl fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandle")
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish()
    }
}
