//! 阶段工作实现: 检测后端与图像服务 (保存 / 模糊 / 遮罩)

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::stage::StageWorker;
use super::{Frame, StageKind, StagePayload};
use crate::detection::{DetectionBackend, Detections};
use crate::error::PipelineError;
use crate::{gen_time_string, Region};

/// 检测 / 颜色阶段: 把帧交给检测后端
#[derive(Debug)]
pub struct BackendWorker {
    backend: DetectionBackend,
}

impl BackendWorker {
    pub fn new(backend: DetectionBackend) -> Self {
        Self { backend }
    }
}

impl StageWorker for BackendWorker {
    fn process(&mut self, frame: &Frame) -> Result<StagePayload, PipelineError> {
        Ok(match self.backend.detect(&frame.image)? {
            Detections::Objects(result) => StagePayload::Detection(result),
            Detections::Regions(result) => StagePayload::Color(result),
        })
    }
}

// ========== 图像服务 ==========

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlurParams {
    pub dir: PathBuf,
    #[serde(default = "default_sigma")]
    pub sigma: f32,
}

fn default_sigma() -> f32 {
    8.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskParams {
    pub dir: PathBuf,
    pub regions: Vec<Region>,
    #[serde(default)]
    pub color: [u8; 3],
}

/// 图像服务配置; 各项为 None 时不创建对应阶段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageServiceParams {
    pub save_dir: Option<PathBuf>,
    pub blur: Option<BlurParams>,
    pub mask: Option<MaskParams>,
    pub extension: String,
}

impl Default for ImageServiceParams {
    fn default() -> Self {
        Self {
            save_dir: None,
            blur: None,
            mask: None,
            extension: "jpg".into(),
        }
    }
}

impl ImageServiceParams {
    pub fn is_empty(&self) -> bool {
        self.save_dir.is_none() && self.blur.is_none() && self.mask.is_none()
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.extension.is_empty()
            || image::ImageFormat::from_extension(&self.extension).is_none()
        {
            return Err(PipelineError::Configuration(format!(
                "unsupported image extension `{}`",
                self.extension
            )));
        }
        if let Some(blur) = &self.blur {
            if !(blur.sigma > 0.0) {
                return Err(PipelineError::Configuration(format!(
                    "blur sigma must be positive, got {}",
                    blur.sigma
                )));
            }
        }
        if let Some(mask) = &self.mask {
            if let Some(r) = mask.regions.iter().find(|r| r.width <= 0 || r.height <= 0) {
                return Err(PipelineError::Configuration(format!(
                    "mask region {r:?} has no area"
                )));
            }
        }
        Ok(())
    }

    /// 校验参数, 创建输出目录, 返回各服务的工作实现
    pub fn build_workers(&self) -> Result<Vec<(StageKind, ImageWorker)>, PipelineError> {
        self.validate()?;
        let mut workers = Vec::new();
        if let Some(dir) = &self.save_dir {
            workers.push((
                StageKind::Save,
                ImageWorker::new(dir, &self.extension, ImageOp::Save)?,
            ));
        }
        if let Some(blur) = &self.blur {
            workers.push((
                StageKind::Blur,
                ImageWorker::new(&blur.dir, &self.extension, ImageOp::Blur { sigma: blur.sigma })?,
            ));
        }
        if let Some(mask) = &self.mask {
            workers.push((
                StageKind::Mask,
                ImageWorker::new(
                    &mask.dir,
                    &self.extension,
                    ImageOp::Mask {
                        regions: mask.regions.clone(),
                        color: Rgb(mask.color),
                    },
                )?,
            ));
        }
        Ok(workers)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageOp {
    Save,
    Blur { sigma: f32 },
    Mask { regions: Vec<Region>, color: Rgb<u8> },
}

/// 图像服务阶段: 处理后以 `<session>_<时间>.<ext>` 写入目录
#[derive(Debug)]
pub struct ImageWorker {
    dir: PathBuf,
    extension: String,
    op: ImageOp,
}

impl ImageWorker {
    pub fn new(dir: &Path, extension: &str, op: ImageOp) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir).map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot create output directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            extension: extension.to_string(),
            op,
        })
    }

    fn output_path(&self, session: u64) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.{}",
            session,
            gen_time_string(""),
            self.extension
        ))
    }

    fn write(&self, image: &RgbImage, session: u64) -> Result<(), PipelineError> {
        let path = self.output_path(session);
        image.save(&path).map_err(|e| {
            PipelineError::Detection(format!("failed to write {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), session, "图像已保存");
        Ok(())
    }
}

impl StageWorker for ImageWorker {
    fn process(&mut self, frame: &Frame) -> Result<StagePayload, PipelineError> {
        match &self.op {
            ImageOp::Save => self.write(&frame.image, frame.session)?,
            ImageOp::Blur { sigma } => {
                let blurred = gaussian_blur_f32(&*frame.image, *sigma);
                self.write(&blurred, frame.session)?;
            }
            ImageOp::Mask { regions, color } => {
                let mut masked = (*frame.image).clone();
                for r in regions {
                    draw_filled_rect_mut(
                        &mut masked,
                        Rect::at(r.x, r.y).of_size(r.width as u32, r.height as u32),
                        *color,
                    );
                }
                self.write(&masked, frame.session)?;
            }
        }
        Ok(StagePayload::Ack)
    }
}
