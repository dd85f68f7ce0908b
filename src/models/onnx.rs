// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ONNX 推理引擎 (ort)
//!
//! YOLOv7-P5 三检测头输出: 每个头 `[1, 3, grid, grid, classes + 5]`, 未经激活.

use anyhow::{bail, Context, Result};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::{EngineSpec, InferenceEngine};
use crate::Bbox;

const STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
const ANCHORS: [[f32; 6]; 3] = [
    [12.0, 16.0, 19.0, 36.0, 40.0, 28.0],
    [36.0, 75.0, 76.0, 55.0, 72.0, 146.0],
    [142.0, 110.0, 192.0, 243.0, 459.0, 401.0],
];

pub struct OrtEngine {
    session: Session,
    input_size: u32,
    class_count: usize,
    thresh: f32,
    hier_thresh: f32,
}

impl OrtEngine {
    pub fn new(spec: &EngineSpec) -> Result<Self> {
        let session = Session::builder()
            .context("failed to create ORT session builder")?
            .commit_from_file(&spec.weights_file)
            .with_context(|| format!("failed to load ONNX model {}", spec.weights_file.display()))?;
        info!(
            model = %spec.weights_file.display(),
            input_size = spec.input_size,
            classes = spec.class_count,
            "ONNX 模型加载成功"
        );
        Ok(Self {
            session,
            input_size: spec.input_size,
            class_count: spec.class_count,
            thresh: spec.thresh,
            hier_thresh: spec.hier_thresh,
        })
    }

    /// 预处理: 长宽比超过 1.2 时补成正方形 (右下补零), 再缩放到输入尺寸
    ///
    /// 返回 NCHW 张量与 (ratio_w, ratio_h)
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, f32, f32) {
        let (col, row) = image.dimensions();
        let max_len = col.max(row);
        let padded;
        let net_input = if max_len as f32 > 1.2 * col as f32 || max_len as f32 > 1.2 * row as f32 {
            let mut square = RgbImage::new(max_len, max_len);
            imageops::replace(&mut square, image, 0, 0);
            padded = square;
            &padded
        } else {
            image
        };

        let ratio_w = net_input.width() as f32 / self.input_size as f32;
        let ratio_h = net_input.height() as f32 / self.input_size as f32;

        let resized = imageops::resize(
            net_input,
            self.input_size,
            self.input_size,
            imageops::FilterType::Triangle,
        );

        let side = self.input_size as usize;
        let mut xs = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0;
            xs[[0, 0, y, x]] = r as f32 / 255.0;
            xs[[0, 1, y, x]] = g as f32 / 255.0;
            xs[[0, 2, y, x]] = b as f32 / 255.0;
        }
        (xs, ratio_w, ratio_h)
    }
}

impl InferenceEngine for OrtEngine {
    fn forward(&mut self, image: &RgbImage) -> Result<Vec<Bbox>> {
        let (xs, ratio_w, ratio_h) = self.preprocess(image);
        let side = self.input_size as usize;
        let (data, _) = xs.into_raw_vec_and_offset();
        let tensor = Tensor::from_array(([1usize, 3, side, side], data.into_boxed_slice()))
            .context("failed to create input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("ONNX inference failed")?;

        let heads = outputs
            .iter()
            .map(|(_, value)| {
                value
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .context("failed to extract output tensor")
            })
            .collect::<Result<Vec<_>>>()?;
        if heads.len() != STRIDES.len() {
            bail!(
                "expected {} detection heads, model produced {}",
                STRIDES.len(),
                heads.len()
            );
        }

        let decoder = Decoder {
            input_size: self.input_size as f32,
            class_count: self.class_count,
            thresh: self.thresh,
            hier_thresh: self.hier_thresh,
            ratio_w,
            ratio_h,
        };
        let mut boxes = Vec::new();
        for (head, pdata) in heads.iter().enumerate() {
            decoder.decode_head(head, pdata, &mut boxes)?;
        }
        debug!(candidates = boxes.len(), "ONNX 解码完成");
        Ok(boxes)
    }
}

struct Decoder {
    input_size: f32,
    class_count: usize,
    thresh: f32,
    hier_thresh: f32,
    ratio_w: f32,
    ratio_h: f32,
}

impl Decoder {
    fn decode_head(&self, head: usize, pdata: &[f32], out: &mut Vec<Bbox>) -> Result<()> {
        let stride = STRIDES[head];
        let grid = (self.input_size / stride) as usize;
        let net_width = self.class_count + 5;
        let expected = 3 * grid * grid * net_width;
        if pdata.len() != expected {
            bail!(
                "head {} has {} values, expected {} (3 x {} x {} x {})",
                head,
                pdata.len(),
                expected,
                grid,
                grid,
                net_width
            );
        }

        for (cell, row) in pdata.chunks_exact(net_width).enumerate() {
            let anchor = cell / (grid * grid);
            let i = (cell / grid) % grid;
            let j = cell % grid;

            let box_score = sigmoid(row[4]);
            if box_score < self.hier_thresh {
                continue;
            }
            let (class_id, max_score) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, (id, s)| if s > best.1 { (id, s) } else { best });
            let class_score = sigmoid(max_score);
            if class_score < self.thresh {
                continue;
            }

            let anchor_w = ANCHORS[head][anchor * 2];
            let anchor_h = ANCHORS[head][anchor * 2 + 1];
            let x = (sigmoid(row[0]) * 2.0 - 0.5 + j as f32) * stride;
            let y = (sigmoid(row[1]) * 2.0 - 0.5 + i as f32) * stride;
            let w = (sigmoid(row[2]) * 2.0).powi(2) * anchor_w;
            let h = (sigmoid(row[3]) * 2.0).powi(2) * anchor_h;

            out.push(Bbox::new(
                (x - 0.5 * w) * self.ratio_w,
                (y - 0.5 * h) * self.ratio_h,
                w * self.ratio_w,
                h * self.ratio_h,
                class_id,
                class_score * box_score,
            ));
        }
        Ok(())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
