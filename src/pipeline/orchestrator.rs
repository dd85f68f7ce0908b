//! 流水线编排 (Orchestrator)
//!
//! 职责:
//! 1. 配置并启动各阶段 (检测 / 颜色 / 图像服务)
//! 2. 为每帧分配会话号, 按分发策略把帧推入各阶段输入缓冲区
//! 3. 按会话号收集结果; 读到其他在途会话的结果时暂存, 已放弃会话的结果丢弃
//! 4. 关闭时停止全部阶段并汇总统计

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{debug, info, warn};

use super::stage::{PipelineStage, StageHandle, StageOptions, StageReport, StageState};
use super::workers::{BackendWorker, ImageServiceParams};
use super::{Frame, FrameOutcome, StageKind, StageOutcome, StagePayload, StageResult};
use crate::config::{Backpressure, FanOut, PipelineConfig};
use crate::detection::{
    BackendConfig, BackendKind, ColorParams, ColorResult, DetectionBackend, DetectionParams,
    DetectionResult, PartitionParams,
};
use crate::error::PipelineError;
use crate::models::{DefaultEngineLoader, EngineLoader};

/// 当前生效的颜色阶段参数
#[derive(Clone, Debug, PartialEq)]
pub struct ColorStageConfig {
    pub kind: BackendKind,
    pub params: ColorParams,
    pub partition: PartitionParams,
    pub min_height: i32,
    pub min_width: i32,
}

/// 当前生效的检测阶段参数
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionStageConfig {
    pub kind: BackendKind,
    pub params: DetectionParams,
    pub partition: PartitionParams,
}

/// 分发后某个半边的状态
#[derive(Clone, Debug, PartialEq)]
enum Half {
    NotRequested,
    Pending,
    Dropped,
    Failed(PipelineError),
}

/// 已分发、待收集的会话
#[derive(Debug)]
#[must_use = "dispatched sessions must be collected"]
pub struct Ticket {
    session: u64,
    detection: Half,
    color: Half,
}

impl Ticket {
    pub fn session(&self) -> u64 {
        self.session
    }
}

pub struct Orchestrator {
    config: PipelineConfig,
    loader: Arc<dyn EngineLoader>,

    detection: Option<StageHandle>,
    color: Option<StageHandle>,
    services: Vec<StageHandle>,

    detection_config: Option<DetectionStageConfig>,
    color_config: Option<ColorStageConfig>,
    service_config: Option<ImageServiceParams>,

    next_session: u64,
    service_session: u64,

    // 会话关联
    outstanding: BTreeMap<(u64, StageKind), Instant>, // 分发时刻
    stash: BTreeMap<(u64, StageKind), Result<StagePayload, PipelineError>>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_engine_loader(config, Arc::new(DefaultEngineLoader))
    }

    /// 使用自定义推理引擎构建器 (例如接入 darknet 运行时)
    pub fn with_engine_loader(
        config: PipelineConfig,
        loader: Arc<dyn EngineLoader>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            loader,
            detection: None,
            color: None,
            services: Vec::new(),
            detection_config: None,
            color_config: None,
            service_config: None,
            next_session: 1,
            service_session: 0,
            outstanding: BTreeMap::new(),
            stash: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========== 配置 ==========

    /// 配置并启动目标检测阶段
    pub fn configure_detection(
        &mut self,
        kind: BackendKind,
        params: DetectionParams,
        partition: PartitionParams,
    ) -> Result<(), PipelineError> {
        ensure_idle(&self.detection, StageKind::Detection)?;
        if kind.is_color() && kind != BackendKind::RegionGrow {
            return Err(PipelineError::Configuration(format!(
                "{kind} is not an object detection backend"
            )));
        }

        let mut backend = DetectionBackend::create(kind, Arc::clone(&self.loader))?;
        backend.configure(BackendConfig::Neural {
            params: params.clone(),
            partition: partition.clone(),
        })?;

        let stage = PipelineStage::new(
            StageKind::Detection,
            BackendWorker::new(backend),
            StageOptions::from_config(&self.config),
        );
        self.detection = Some(stage.start()?);
        info!(%kind, partitioned = partition.enabled, "目标检测阶段已启动");
        self.detection_config = Some(DetectionStageConfig {
            kind,
            params,
            partition,
        });
        Ok(())
    }

    /// 配置并启动颜色检测阶段
    pub fn configure_color(
        &mut self,
        kind: BackendKind,
        params: ColorParams,
        partition: PartitionParams,
        min_height: i32,
        min_width: i32,
    ) -> Result<(), PipelineError> {
        ensure_idle(&self.color, StageKind::Color)?;
        if !kind.is_color() {
            return Err(PipelineError::Configuration(format!(
                "{kind} is not a color detection backend"
            )));
        }

        let mut backend = DetectionBackend::create(kind, Arc::clone(&self.loader))?;
        backend.configure(BackendConfig::Color {
            params: params.clone(),
            partition: partition.clone(),
            min_height,
            min_width,
        })?;

        let stage = PipelineStage::new(
            StageKind::Color,
            BackendWorker::new(backend),
            StageOptions::from_config(&self.config),
        );
        self.color = Some(stage.start()?);
        info!(%kind, ranges = params.ranges.len(), "颜色检测阶段已启动");
        self.color_config = Some(ColorStageConfig {
            kind,
            params,
            partition,
            min_height,
            min_width,
        });
        Ok(())
    }

    /// 配置并启动图像服务 (保存 / 模糊 / 遮罩)
    pub fn configure_image_service(
        &mut self,
        params: ImageServiceParams,
    ) -> Result<(), PipelineError> {
        if !self.services.is_empty() {
            return Err(PipelineError::Configuration(
                "image services are already running; shut down before reconfiguring".into(),
            ));
        }
        let workers = params.build_workers()?;
        let mut started = Vec::with_capacity(workers.len());
        for (kind, worker) in workers {
            let stage = PipelineStage::new(kind, worker, StageOptions::for_service(&self.config));
            // 启动失败时已启动的阶段随 started 一起销毁
            started.push(stage.start()?);
            info!(stage = %kind, "图像服务阶段已启动");
        }
        self.services = started;
        self.service_config = Some(params);
        Ok(())
    }

    /// 设置图像服务使用的会话号, 不影响检测会话计数
    pub fn set_session_number(&mut self, session: u64) {
        self.service_session = session;
    }

    pub fn detection_config(&self) -> Option<&DetectionStageConfig> {
        self.detection_config.as_ref()
    }

    pub fn color_config(&self) -> Option<&ColorStageConfig> {
        self.color_config.as_ref()
    }

    pub fn image_service_config(&self) -> Option<&ImageServiceParams> {
        self.service_config.as_ref()
    }

    pub fn stage_state(&self, kind: StageKind) -> Option<StageState> {
        self.handle(kind).map(StageHandle::state)
    }

    pub fn stage_report(&self, kind: StageKind) -> Option<StageReport> {
        self.handle(kind).map(StageHandle::report)
    }

    fn handle(&self, kind: StageKind) -> Option<&StageHandle> {
        match kind {
            StageKind::Detection => self.detection.as_ref(),
            StageKind::Color => self.color.as_ref(),
            _ => self.services.iter().find(|h| h.kind() == kind),
        }
    }

    // ========== 帧提交 ==========

    /// 分发并等待结果
    pub fn submit_frame(
        &mut self,
        image: impl Into<Arc<RgbImage>>,
        run_detection: bool,
        run_color: bool,
    ) -> FrameOutcome {
        let ticket = self.dispatch(image, run_detection, run_color);
        self.collect(ticket)
    }

    /// 分配会话号并把帧推入所选阶段; 不等待结果
    pub fn dispatch(
        &mut self,
        image: impl Into<Arc<RgbImage>>,
        run_detection: bool,
        run_color: bool,
    ) -> Ticket {
        let image = image.into();
        let session = self.next_session;
        self.next_session += 1;

        let detection = if run_detection {
            self.dispatch_to(StageKind::Detection, session, &image)
        } else {
            Half::NotRequested
        };
        let color = if run_color {
            self.dispatch_to(StageKind::Color, session, &image)
        } else {
            Half::NotRequested
        };
        self.dispatch_services(&image);

        debug!(session, ?detection, ?color, "帧已分发");
        Ticket {
            session,
            detection,
            color,
        }
    }

    fn dispatch_to(&mut self, kind: StageKind, session: u64, image: &Arc<RgbImage>) -> Half {
        let frame = Frame::new(session, share(image, self.config.fan_out));
        let backpressure = self.config.backpressure;
        let handle = match kind {
            StageKind::Detection => self.detection.as_mut(),
            _ => self.color.as_mut(),
        };
        let Some(handle) = handle else {
            return Half::Failed(PipelineError::BackendNotSelected(format!(
                "{kind} stage is not configured"
            )));
        };
        match push_with_backpressure(handle, frame, backpressure) {
            Ok(()) => {
                self.outstanding.insert((session, kind), Instant::now());
                Half::Pending
            }
            Err(_frame) => {
                warn!(stage = %kind, session, "输入缓冲区已满, 丢弃帧");
                Half::Dropped
            }
        }
    }

    fn dispatch_services(&mut self, image: &Arc<RgbImage>) {
        let session = self.service_session;
        let fan_out = self.config.fan_out;
        for handle in &mut self.services {
            if let Err(frame) = handle.submit(Frame::new(session, share(image, fan_out))) {
                warn!(stage = %handle.kind(), session = frame.session, "服务输入缓冲区已满, 丢弃帧");
            }
        }
    }

    /// 等待会话结果, 总时长不超过 `result_timeout`
    pub fn collect(&mut self, ticket: Ticket) -> FrameOutcome {
        let deadline = Instant::now() + self.config.result_timeout();
        let Ticket {
            session,
            detection,
            color,
        } = ticket;

        let detection = match self.resolve(StageKind::Detection, session, detection, deadline) {
            Resolved::Payload(StagePayload::Detection(result)) => StageOutcome::Completed(result),
            other => other.into_outcome::<DetectionResult>(StageKind::Detection),
        };
        let color = match self.resolve(StageKind::Color, session, color, deadline) {
            Resolved::Payload(StagePayload::Color(result)) => StageOutcome::Completed(result),
            other => other.into_outcome::<ColorResult>(StageKind::Color),
        };

        FrameOutcome {
            session,
            detection,
            color,
        }
    }

    fn resolve(&mut self, kind: StageKind, session: u64, half: Half, deadline: Instant) -> Resolved {
        match half {
            Half::NotRequested => Resolved::NotRequested,
            Half::Dropped => Resolved::Dropped,
            Half::Failed(e) => Resolved::Failed(e),
            Half::Pending => match self.await_result(kind, session, deadline) {
                Some(Ok(payload)) => Resolved::Payload(payload),
                Some(Err(e)) => Resolved::Failed(e),
                None => {
                    warn!(stage = %kind, session, "等待结果超时");
                    Resolved::TimedOut
                }
            },
        }
    }

    fn await_result(
        &mut self,
        kind: StageKind,
        session: u64,
        deadline: Instant,
    ) -> Option<Result<StagePayload, PipelineError>> {
        let key = (session, kind);
        self.expire_abandoned(key);
        if let Some(outcome) = self.stash.remove(&key) {
            self.outstanding.remove(&key);
            return Some(outcome);
        }

        let handle = match kind {
            StageKind::Detection => self.detection.as_mut(),
            _ => self.color.as_mut(),
        };
        let Some(handle) = handle else {
            self.outstanding.remove(&key);
            return None;
        };

        loop {
            let Some(StageResult {
                session: got,
                outcome,
                ..
            }) = handle.wait_result(deadline)
            else {
                // 超时: 之后到达的结果按已放弃会话丢弃
                self.outstanding.remove(&key);
                return None;
            };
            if got == session {
                self.outstanding.remove(&key);
                return Some(outcome);
            }
            if self.outstanding.contains_key(&(got, kind)) {
                debug!(stage = %kind, session = got, waiting = session, "暂存其他会话的结果");
                self.stash.insert((got, kind), outcome);
            } else {
                debug!(stage = %kind, session = got, "丢弃已放弃会话的结果");
            }
        }
    }

    /// 清理分发后超过 `result_timeout` 仍未收集的会话及其暂存结果; `keep` 除外
    fn expire_abandoned(&mut self, keep: (u64, StageKind)) {
        let timeout = self.config.result_timeout();
        let now = Instant::now();
        let before = self.outstanding.len();
        self.outstanding
            .retain(|key, dispatched| *key == keep || now.duration_since(*dispatched) < timeout);
        let outstanding = &self.outstanding;
        self.stash.retain(|key, _| outstanding.contains_key(key));

        let expired = before - self.outstanding.len();
        if expired > 0 {
            debug!(expired, "清理超时未收集的会话");
        }
    }

    /// 取出图像服务回执
    pub fn poll_service_reports(&mut self) -> Vec<StageResult> {
        let mut reports = Vec::new();
        for handle in &mut self.services {
            while let Some(result) = handle.try_result() {
                reports.push(result);
            }
        }
        reports
    }

    /// 停止所有阶段并返回统计; 之后可以重新配置
    pub fn shutdown(&mut self) -> Vec<StageReport> {
        let mut reports = Vec::new();
        for mut handle in self
            .detection
            .take()
            .into_iter()
            .chain(self.color.take())
            .chain(self.services.drain(..))
        {
            reports.push(handle.stop());
        }
        if !self.outstanding.is_empty() {
            debug!(pending = self.outstanding.len(), "关闭时仍有未收集的会话");
        }
        self.outstanding.clear();
        self.stash.clear();
        self.detection_config = None;
        self.color_config = None;
        self.service_config = None;
        reports
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Resolved {
    NotRequested,
    Payload(StagePayload),
    Failed(PipelineError),
    Dropped,
    TimedOut,
}

impl Resolved {
    fn into_outcome<T>(self, kind: StageKind) -> StageOutcome<T> {
        match self {
            Resolved::NotRequested => StageOutcome::NotRequested,
            Resolved::Failed(e) => StageOutcome::Failed(e),
            Resolved::Dropped => StageOutcome::Dropped,
            Resolved::TimedOut => StageOutcome::TimedOut,
            Resolved::Payload(other) => StageOutcome::Failed(PipelineError::Detection(format!(
                "{kind} stage returned an unexpected payload: {other:?}"
            ))),
        }
    }
}

fn ensure_idle(handle: &Option<StageHandle>, kind: StageKind) -> Result<(), PipelineError> {
    match handle {
        Some(_) => Err(PipelineError::Configuration(format!(
            "{kind} stage is already running; shut down before reconfiguring"
        ))),
        None => Ok(()),
    }
}

fn share(image: &Arc<RgbImage>, fan_out: FanOut) -> Arc<RgbImage> {
    match fan_out {
        FanOut::Shared => Arc::clone(image),
        FanOut::Copy => Arc::new(RgbImage::clone(image)),
    }
}

fn push_with_backpressure(
    handle: &mut StageHandle,
    frame: Frame,
    backpressure: Backpressure,
) -> Result<(), Frame> {
    let mut frame = match handle.submit(frame) {
        Ok(()) => return Ok(()),
        Err(frame) => frame,
    };
    if let Backpressure::Retry {
        attempts,
        interval_ms,
    } = backpressure
    {
        for attempt in 1..=attempts {
            thread::sleep(Duration::from_millis(interval_ms));
            match handle.submit(frame) {
                Ok(()) => {
                    debug!(stage = %handle.kind(), attempt, "重试提交成功");
                    return Ok(());
                }
                Err(back) => frame = back,
            }
        }
    }
    Err(frame)
}
