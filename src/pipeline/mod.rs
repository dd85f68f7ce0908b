/// 帧处理流水线 (Frame Processing Pipeline)
///
/// 每个阶段一个工作线程, 阶段之间通过 SPSC 环形缓冲区传递所有权:
/// - Detection: 神经网络目标检测
/// - Color:     颜色区间检测
/// - Save / Blur / Mask: 图像服务 (落盘)
///
/// 调用方线程经 [`orchestrator::Orchestrator`] 分发帧, 并按会话号收集结果.
pub mod orchestrator;
pub mod stage;
pub mod workers;

use std::fmt;
use std::sync::Arc;

use image::RgbImage;

use crate::detection::{ColorResult, DetectionResult};
use crate::error::PipelineError;

// ========== 阶段间消息类型 ==========

/// 输入帧 (调用方 → 阶段线程)
#[derive(Clone, Debug)]
pub struct Frame {
    pub session: u64,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(session: u64, image: Arc<RgbImage>) -> Self {
        Self { session, image }
    }
}

/// 阶段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Detection,
    Color,
    Save,
    Blur,
    Mask,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Detection => "detection",
            StageKind::Color => "color",
            StageKind::Save => "save",
            StageKind::Blur => "blur",
            StageKind::Mask => "mask",
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, StageKind::Save | StageKind::Blur | StageKind::Mask)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 阶段产出
#[derive(Clone, Debug, PartialEq)]
pub enum StagePayload {
    Detection(DetectionResult),
    Color(ColorResult),
    /// 图像服务完成回执
    Ack,
}

/// 带会话号的阶段结果 (阶段线程 → 调用方)
#[derive(Clone, Debug, PartialEq)]
pub struct StageResult {
    pub session: u64,
    pub stage: StageKind,
    pub outcome: Result<StagePayload, PipelineError>,
}

/// 单个阶段对某一会话的最终结论
#[derive(Clone, Debug, PartialEq, Default)]
pub enum StageOutcome<T> {
    /// 调用方未请求该阶段
    #[default]
    NotRequested,
    Completed(T),
    Failed(PipelineError),
    /// 输入缓冲区已满, 帧被丢弃
    Dropped,
    /// 截止时间前未收到结果
    TimedOut,
}

impl<T> StageOutcome<T> {
    pub fn completed(&self) -> Option<&T> {
        match self {
            StageOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_completed(self) -> Option<T> {
        match self {
            StageOutcome::Completed(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            StageOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed(_))
    }

    pub fn is_requested(&self) -> bool {
        !matches!(self, StageOutcome::NotRequested)
    }

    fn label(&self) -> String {
        match self {
            StageOutcome::NotRequested => "not requested".into(),
            StageOutcome::Completed(_) => "completed".into(),
            StageOutcome::Failed(e) => format!("failed ({e})"),
            StageOutcome::Dropped => "dropped".into(),
            StageOutcome::TimedOut => "timed out".into(),
        }
    }
}

/// 一帧的聚合结果; 两个半边互不影响
#[derive(Clone, Debug, PartialEq)]
pub struct FrameOutcome {
    pub session: u64,
    pub detection: StageOutcome<DetectionResult>,
    pub color: StageOutcome<ColorResult>,
}

impl FrameOutcome {
    /// 所有请求的半边都已完成
    pub fn is_success(&self) -> bool {
        [
            (self.detection.is_requested(), self.detection.is_completed()),
            (self.color.is_requested(), self.color.is_completed()),
        ]
        .iter()
        .all(|&(requested, done)| !requested || done)
    }

    /// 未完成半边的说明, 全部成功时为空
    pub fn error_message(&self) -> String {
        let mut parts = Vec::new();
        if self.detection.is_requested() && !self.detection.is_completed() {
            parts.push(format!("detection {}", self.detection.label()));
        }
        if self.color.is_requested() && !self.color.is_completed() {
            parts.push(format!("color {}", self.color.label()));
        }
        parts.join("; ")
    }
}
