// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 流水线与检测配置
pub mod detection; // 检测后端 (神经网络 / 颜色区间)
pub mod error; // 错误类型与错误码
pub mod models; // 推理引擎接口与实现
pub mod pipeline; // 多阶段异步流水线
pub mod ring_buffer; // SPSC 无锁环形缓冲区

use serde::{Deserialize, Serialize};

pub use crate::config::{Backpressure, FanOut, NetraConfig, PipelineConfig};
pub use crate::detection::{
    BackendKind, ColorParams, ColorRange, ColorResult, DetectionParams, DetectionResult,
    PartitionParams,
};
pub use crate::error::{ErrorCode, ErrorDetails, PipelineError};
pub use crate::models::{DefaultEngineLoader, EngineLoader, EngineSpec, InferenceEngine};
pub use crate::pipeline::orchestrator::{Orchestrator, Ticket};
pub use crate::pipeline::workers::ImageServiceParams;
pub use crate::pipeline::{FrameOutcome, StageKind, StageOutcome, StageResult};
pub use crate::ring_buffer::RingBuffer;

/// 非极大值抑制 (类别无关)
pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 按类别分别做非极大值抑制, 不同类别的框互不抑制
pub fn non_max_suppression_per_class(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    let mut by_class: std::collections::BTreeMap<usize, Vec<Bbox>> = Default::default();
    for bbox in xs.drain(..) {
        by_class.entry(bbox.id()).or_default().push(bbox);
    }
    for (_, mut boxes) in by_class {
        non_max_suppression(&mut boxes, iou_threshold);
        xs.extend(boxes);
    }
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));
}

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around an object
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new_from_xywh(xmin: f32, ymin: f32, width: f32, height: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = (self.xmin + self.width).min(another.xmin + another.width);
        let t = self.ymin.max(another.ymin);
        let b = (self.ymin + self.height).min(another.ymin + another.height);
        (r - l + 1.).max(0.) * (b - t + 1.).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        self.intersection_area(another) / self.union(another)
    }
}

/// 整数像素矩形区域 (检测结果对外表示)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 浮点框截断为整数像素
    pub fn from_bbox(bbox: &Bbox) -> Self {
        Self {
            x: bbox.xmin() as i32,
            y: bbox.ymin() as i32,
            width: bbox.width() as i32,
            height: bbox.height() as i32,
        }
    }

    /// 分区坐标 → 整图坐标
    pub fn translate_x(self, dx: i32) -> Self {
        Self {
            x: self.x + dx,
            ..self
        }
    }
}
