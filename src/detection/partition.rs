//! 分区检测: 竖条规划、裁剪与坐标平移

use std::borrow::Cow;

use image::{imageops, RgbImage};
use tracing::debug;

use super::PartitionParams;

/// 图像中的一个竖条 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strip {
    pub index: u32,
    pub start: u32,
    pub end: u32,
}

impl Strip {
    pub fn full(width: u32) -> Self {
        Self {
            index: 0,
            start: 0,
            end: width,
        }
    }

    pub fn width(&self) -> u32 {
        self.end - self.start
    }

    /// 条内 x 坐标平移到整图所需的偏移量
    pub fn offset(&self) -> i32 {
        self.start as i32
    }
}

/// 规划需要检测的竖条
///
/// 条宽 `width / partitions` (整除), 第 `i` 条为 `[i * w, min((i + 1) * w, width))`.
/// 未启用分区时返回整幅图像.
pub fn plan(width: u32, params: &PartitionParams) -> Vec<Strip> {
    if !params.enabled || params.partitions == 0 {
        return vec![Strip::full(width)];
    }
    let strip_width = width / params.partitions;
    params
        .indices
        .iter()
        .filter_map(|&index| {
            let start = index.saturating_mul(strip_width).min(width);
            let end = index
                .saturating_add(1)
                .saturating_mul(strip_width)
                .min(width);
            if end > start {
                Some(Strip { index, start, end })
            } else {
                debug!(index, width, partitions = params.partitions, "跳过空分区");
                None
            }
        })
        .collect()
}

/// 裁出竖条; 整幅图像时直接借用
pub fn crop(image: &RgbImage, strip: Strip) -> Cow<'_, RgbImage> {
    if strip.start == 0 && strip.end == image.width() {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(
            imageops::crop_imm(image, strip.start, 0, strip.width(), image.height()).to_image(),
        )
    }
}
