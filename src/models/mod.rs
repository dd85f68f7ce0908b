/// 推理引擎接口与实现
///
/// # 架构说明
///
/// 检测后端 (`detection::NeuralDetector`) 负责阈值过滤、NMS、分区与合并;
/// 推理引擎只负责: 图片 → 像素坐标下的候选框.
///
/// ## 引擎实现
/// - **ONNX**: `onnx.rs`, 基于 ort (需开启 `onnx` feature)
/// - **Darknet**: 未内置运行时, 通过自定义 [`EngineLoader`] 注入;
///   `darknet.rs` 提供网络定义解析与类别名加载
///
/// ## 使用示例
/// ```no_run
/// use std::sync::Arc;
/// use netravision_rs::models::{DefaultEngineLoader, EngineLoader, EngineSpec, NeuralKind};
///
/// let spec = EngineSpec::new(NeuralKind::Onnx, "yolov7.onnx", 80);
/// let mut engine = DefaultEngineLoader.load(&spec)?;
/// let image = image::RgbImage::new(640, 480);
/// let boxes = engine.forward(&image)?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub mod darknet;
#[cfg(feature = "onnx")]
pub mod onnx;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use image::RgbImage;

use crate::Bbox;

/// 神经网络后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeuralKind {
    /// darknet 网络定义 + 权重
    Darknet,
    /// ONNX 模型
    Onnx,
}

impl NeuralKind {
    /// 从模型路径推断类型
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("onnx") => NeuralKind::Onnx,
            _ => NeuralKind::Darknet,
        }
    }

    /// 是否需要网络定义文件
    pub fn needs_cfg(&self) -> bool {
        matches!(self, NeuralKind::Darknet)
    }
}

impl fmt::Display for NeuralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NeuralKind::Darknet => f.write_str("darknet"),
            NeuralKind::Onnx => f.write_str("onnx"),
        }
    }
}

/// 统一的推理引擎接口
///
/// ## 核心流程
/// ```text
/// 原始图片 → 预处理 → 推理 → 解码 → 候选框 (原图像素坐标)
/// ```
///
/// 引擎归检测阶段线程独占, 因此只要求 `Send`.
pub trait InferenceEngine: Send {
    /// 前向推理
    ///
    /// # Arguments
    /// * `image` - 输入图片 (整图或分区竖条)
    ///
    /// # Returns
    /// * `Vec<Bbox>` - 候选框, 坐标相对于 `image`, 未做阈值过滤以外的后处理
    fn forward(&mut self, image: &RgbImage) -> Result<Vec<Bbox>>;
}

/// 加载引擎所需的全部信息
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSpec {
    pub kind: NeuralKind,
    pub weights_file: PathBuf,
    pub cfg_file: Option<PathBuf>,
    pub class_count: usize,
    pub thresh: f32,
    pub hier_thresh: f32,
    pub input_size: u32,
}

impl EngineSpec {
    pub fn new(kind: NeuralKind, weights_file: impl Into<PathBuf>, class_count: usize) -> Self {
        Self {
            kind,
            weights_file: weights_file.into(),
            cfg_file: None,
            class_count,
            thresh: 0.5,
            hier_thresh: 0.5,
            input_size: 640,
        }
    }
}

/// 引擎构建器: 后端配置时调用一次
pub trait EngineLoader: Send + Sync {
    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>>;
}

/// 默认构建器: ONNX 走 ort, darknet 需要调用方注入运行时
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEngineLoader;

impl EngineLoader for DefaultEngineLoader {
    fn load(&self, spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>> {
        match spec.kind {
            NeuralKind::Onnx => load_onnx(spec),
            NeuralKind::Darknet => {
                bail!("no darknet runtime linked; supply an EngineLoader for darknet models")
            }
        }
    }
}

#[cfg(feature = "onnx")]
fn load_onnx(spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>> {
    Ok(Box::new(onnx::OrtEngine::new(spec)?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(spec: &EngineSpec) -> Result<Box<dyn InferenceEngine>> {
    bail!(
        "cannot load {}: built without the `onnx` feature",
        spec.weights_file.display()
    )
}
