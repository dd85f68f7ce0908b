/// 检测后端 (Detection Backends)
///
/// 统一的检测契约: `configure` → `detect`, 失败时记录错误码
/// - Neural:     darknet / ONNX 神经网络目标检测 (`neural.rs`)
/// - ColorRange: HSV 颜色区间 + 轮廓检测 (`color.rs`)
/// - 分区检测:   竖条切分与坐标平移 (`partition.rs`)
pub mod color;
pub mod neural;
pub mod partition;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};

pub use color::{ColorParams, ColorRange, ColorRangeDetector};
pub use neural::NeuralDetector;

use crate::error::{ErrorDetails, PipelineError};
use crate::models::{EngineLoader, NeuralKind};
use crate::Region;

/// 后端类型 (工厂键)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Darknet,
    Onnx,
    ColorInRange,
    /// 区域生长: 保留的类型, 无实现
    RegionGrow,
}

impl BackendKind {
    pub fn neural_kind(self) -> Option<NeuralKind> {
        match self {
            BackendKind::Darknet => Some(NeuralKind::Darknet),
            BackendKind::Onnx => Some(NeuralKind::Onnx),
            _ => None,
        }
    }

    pub fn is_color(self) -> bool {
        matches!(self, BackendKind::ColorInRange | BackendKind::RegionGrow)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Darknet => "darknet",
            BackendKind::Onnx => "onnx",
            BackendKind::ColorInRange => "color_in_range",
            BackendKind::RegionGrow => "region_grow",
        };
        f.write_str(name)
    }
}

/// 神经网络检测参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    pub cfg_file: PathBuf,     // darknet 网络定义 (.cfg)
    pub names_file: PathBuf,   // 类别名, 每行一个
    pub weights_file: PathBuf, // 权重 / ONNX 模型
    pub nms: f32,              // NMS IOU阈值, <= 0 关闭
    pub thresh: f32,           // 置信度阈值
    pub hier_thresh: f32,      // 层级阈值 (ONNX: 目标性阈值)
    pub input_size: u32,       // 网络输入边长
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            cfg_file: PathBuf::new(),
            names_file: PathBuf::new(),
            weights_file: PathBuf::new(),
            nms: 0.45,
            thresh: 0.5,
            hier_thresh: 0.5,
            input_size: 640,
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (name, value) in [("thresh", self.thresh), ("hier_thresh", self.hier_thresh)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.nms > 1.0 {
            return Err(PipelineError::Configuration(format!(
                "nms must be <= 1, got {}",
                self.nms
            )));
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(PipelineError::Configuration(format!(
                "input_size must be a positive multiple of 32, got {}",
                self.input_size
            )));
        }
        Ok(())
    }
}

/// 分区参数: 将图像按宽度均分为 `partitions` 个竖条, 只检测 `indices` 指定的条
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionParams {
    pub enabled: bool,
    pub partitions: u32,
    pub indices: Vec<u32>,
}

impl PartitionParams {
    pub fn strips(partitions: u32, indices: impl IntoIterator<Item = u32>) -> Self {
        Self {
            enabled: true,
            partitions,
            indices: indices.into_iter().collect(),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.enabled {
            return Ok(());
        }
        if self.partitions == 0 {
            return Err(PipelineError::Configuration(
                "partition count must be positive".into(),
            ));
        }
        if self.indices.is_empty() {
            return Err(PipelineError::Configuration(
                "partitioning enabled without any partition index".into(),
            ));
        }
        if let Some(bad) = self.indices.iter().find(|&&i| i >= self.partitions) {
            return Err(PipelineError::Configuration(format!(
                "partition index {bad} out of range for {} partitions",
                self.partitions
            )));
        }
        Ok(())
    }
}

/// 目标检测结果: 类别 → (区域, 置信度)
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub objects: BTreeMap<usize, Vec<(Region, f32)>>,
    pub count: usize,
}

impl DetectionResult {
    pub fn push(&mut self, class_id: usize, region: Region, confidence: f32) {
        self.objects
            .entry(class_id)
            .or_default()
            .push((region, confidence));
        self.count += 1;
    }

    pub fn class_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.objects.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Region, f32)> + '_ {
        self.objects
            .iter()
            .flat_map(|(&id, v)| v.iter().map(move |(r, c)| (id, r, *c)))
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// 颜色检测结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColorResult {
    pub regions: Vec<Region>,
    pub count: usize,
    /// 命中轮廓总面积 / 检测面积
    pub area_factor: f32,
}

impl ColorResult {
    pub fn push(&mut self, region: Region) {
        self.regions.push(region);
        self.count += 1;
    }
}

/// `configure` 的输入
#[derive(Clone, Debug, PartialEq)]
pub enum BackendConfig {
    Neural {
        params: DetectionParams,
        partition: PartitionParams,
    },
    Color {
        params: ColorParams,
        partition: PartitionParams,
        min_height: i32,
        min_width: i32,
    },
}

/// `detect` 的输出
#[derive(Clone, Debug, PartialEq)]
pub enum Detections {
    Objects(DetectionResult),
    Regions(ColorResult),
}

/// 检测后端 (封闭集合)
pub enum DetectionBackend {
    Neural(NeuralDetector),
    ColorRange(ColorRangeDetector),
}

impl DetectionBackend {
    /// 工厂: 按类型创建未配置的后端
    pub fn create(
        kind: BackendKind,
        loader: Arc<dyn EngineLoader>,
    ) -> Result<Self, PipelineError> {
        match kind {
            BackendKind::Darknet => Ok(Self::Neural(NeuralDetector::new(
                NeuralKind::Darknet,
                loader,
            ))),
            BackendKind::Onnx => Ok(Self::Neural(NeuralDetector::new(NeuralKind::Onnx, loader))),
            BackendKind::ColorInRange => Ok(Self::ColorRange(ColorRangeDetector::new())),
            BackendKind::RegionGrow => Err(PipelineError::BackendNotSelected(
                "region_grow backend is not available".into(),
            )),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Neural(d) => match d.kind() {
                NeuralKind::Darknet => BackendKind::Darknet,
                NeuralKind::Onnx => BackendKind::Onnx,
            },
            Self::ColorRange(_) => BackendKind::ColorInRange,
        }
    }

    pub fn configure(&mut self, config: BackendConfig) -> Result<(), PipelineError> {
        match (self, config) {
            (Self::Neural(d), BackendConfig::Neural { params, partition }) => {
                d.configure(params, partition)
            }
            (
                Self::ColorRange(d),
                BackendConfig::Color {
                    params,
                    partition,
                    min_height,
                    min_width,
                },
            ) => d.configure(params, partition, min_height, min_width),
            (backend, _) => {
                let err = PipelineError::Configuration(format!(
                    "configuration does not match the {} backend",
                    backend.kind()
                ));
                backend.record(&err);
                Err(err)
            }
        }
    }

    pub fn detect(&mut self, image: &RgbImage) -> Result<Detections, PipelineError> {
        match self {
            Self::Neural(d) => d.detect(image).map(Detections::Objects),
            Self::ColorRange(d) => d.detect(image).map(Detections::Regions),
        }
    }

    pub fn is_configured(&self) -> bool {
        match self {
            Self::Neural(d) => d.is_configured(),
            Self::ColorRange(d) => d.is_configured(),
        }
    }

    pub fn last_error(&self) -> &ErrorDetails {
        match self {
            Self::Neural(d) => d.last_error(),
            Self::ColorRange(d) => d.last_error(),
        }
    }

    fn record(&mut self, err: &PipelineError) {
        match self {
            Self::Neural(d) => d.record(Err(err)),
            Self::ColorRange(d) => d.record(Err(err)),
        }
    }
}

impl fmt::Debug for DetectionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionBackend")
            .field("kind", &self.kind())
            .field("configured", &self.is_configured())
            .finish()
    }
}
