//! 神经网络检测后端 (darknet / ONNX)
//!
//! 引擎只负责推理; 本模块负责文件检查、类别名加载、阈值过滤、NMS、分区与合并.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use tracing::{debug, info};

use super::{partition, DetectionParams, DetectionResult, PartitionParams};
use crate::error::{ErrorDetails, PipelineError};
use crate::models::darknet::{load_class_names, DarknetCfg};
use crate::models::{EngineLoader, EngineSpec, InferenceEngine, NeuralKind};
use crate::{non_max_suppression, non_max_suppression_per_class, Region};

pub struct NeuralDetector {
    kind: NeuralKind,
    loader: Arc<dyn EngineLoader>,
    engine: Option<Box<dyn InferenceEngine>>,
    params: DetectionParams,
    partition: PartitionParams,
    class_names: Vec<String>,
    last_error: ErrorDetails,
}

impl NeuralDetector {
    pub fn new(kind: NeuralKind, loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            kind,
            loader,
            engine: None,
            params: DetectionParams::default(),
            partition: PartitionParams::default(),
            class_names: Vec::new(),
            last_error: ErrorDetails::default(),
        }
    }

    pub fn kind(&self) -> NeuralKind {
        self.kind
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn is_configured(&self) -> bool {
        self.engine.is_some()
    }

    pub fn last_error(&self) -> &ErrorDetails {
        &self.last_error
    }

    pub(crate) fn record(&mut self, outcome: Result<(), &PipelineError>) {
        self.last_error = match outcome {
            Ok(()) => ErrorDetails::default(),
            Err(err) => err.details(),
        };
    }

    /// 配置后端; 失败时保持未配置状态
    pub fn configure(
        &mut self,
        params: DetectionParams,
        partition: PartitionParams,
    ) -> Result<(), PipelineError> {
        self.engine = None;
        match self.prepare(&params, &partition) {
            Ok((engine, names)) => {
                info!(
                    kind = %self.kind,
                    classes = names.len(),
                    weights = %params.weights_file.display(),
                    "检测后端配置完成"
                );
                self.engine = Some(engine);
                self.class_names = names;
                self.params = params;
                self.partition = partition;
                self.record(Ok(()));
                Ok(())
            }
            Err(err) => {
                self.class_names.clear();
                self.record(Err(&err));
                Err(err)
            }
        }
    }

    fn prepare(
        &self,
        params: &DetectionParams,
        partition: &PartitionParams,
    ) -> Result<(Box<dyn InferenceEngine>, Vec<String>), PipelineError> {
        partition.validate()?;
        params.validate()?;

        // 1. 文件存在性检查 (先于任何加载)
        if self.kind.needs_cfg() {
            require_file("network configuration", &params.cfg_file)?;
        }
        require_file("weights", &params.weights_file)?;
        require_file("class names", &params.names_file)?;

        // 2. 类别名
        let names = load_class_names(&params.names_file)
            .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;
        if names.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "class names file {} is empty",
                params.names_file.display()
            )));
        }

        // 3. darknet 网络定义与类别数一致性
        if self.kind.needs_cfg() {
            let cfg = DarknetCfg::from_file(&params.cfg_file)
                .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;
            if let Some(classes) = cfg.classes {
                if classes != names.len() {
                    return Err(PipelineError::Configuration(format!(
                        "network defines {} classes but {} lists {}",
                        classes,
                        params.names_file.display(),
                        names.len()
                    )));
                }
            }
        }

        // 4. 构建推理引擎
        let spec = EngineSpec {
            kind: self.kind,
            weights_file: params.weights_file.clone(),
            cfg_file: self.kind.needs_cfg().then(|| params.cfg_file.clone()),
            class_count: names.len(),
            thresh: params.thresh,
            hier_thresh: params.hier_thresh,
            input_size: params.input_size,
        };
        let engine = self.loader.load(&spec).map_err(|e| {
            PipelineError::Configuration(format!("failed to initialize {} backend: {e:#}", self.kind))
        })?;
        Ok((engine, names))
    }

    /// 检测; 结果坐标为整图坐标
    pub fn detect(&mut self, image: &RgbImage) -> Result<DetectionResult, PipelineError> {
        let outcome = self.run(image);
        self.record(outcome.as_ref().map(|_| ()));
        outcome
    }

    fn run(&mut self, image: &RgbImage) -> Result<DetectionResult, PipelineError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(PipelineError::BackendNotSelected(format!(
                "{} backend is not configured",
                self.kind
            )));
        };
        let class_count = self.class_names.len();
        let mut result = DetectionResult::default();

        for strip in partition::plan(image.width(), &self.partition) {
            let view = partition::crop(image, strip);
            let mut boxes = engine
                .forward(&view)
                .map_err(|e| PipelineError::Detection(format!("{e:#}")))?;

            boxes.retain(|b| b.confidence() > self.params.thresh && b.id() < class_count);
            if self.params.nms > 0.0 {
                match self.kind {
                    NeuralKind::Darknet => non_max_suppression_per_class(&mut boxes, self.params.nms),
                    NeuralKind::Onnx => non_max_suppression(&mut boxes, self.params.nms),
                }
            }
            debug!(strip = strip.index, objects = boxes.len(), "分区检测完成");

            for bbox in &boxes {
                let region = Region::from_bbox(bbox).translate_x(strip.offset());
                result.push(bbox.id(), region, bbox.confidence());
            }
        }
        Ok(result)
    }
}

fn require_file(artifact: &'static str, path: &Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::file_not_found(artifact, path))
    }
}

impl fmt::Debug for NeuralDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeuralDetector")
            .field("kind", &self.kind)
            .field("configured", &self.is_configured())
            .field("classes", &self.class_names.len())
            .field("partition", &self.partition)
            .finish()
    }
}
