//! 颜色区间检测 (HSV inRange + 外轮廓)
//!
//! 流程: RGB → HSV (H 映射到 0..=255) → 各区间掩码取并 → 闭运算 → 外轮廓
//! → 面积过滤 → 外接矩形尺寸过滤.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::close;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{partition, ColorResult, PartitionParams};
use crate::error::{ErrorDetails, PipelineError};
use crate::Region;

/// 闭运算半径 (LInf, 5x5 方形结构元)
const CLOSE_RADIUS: u8 = 2;

/// HSV 闭区间, 三个通道依次为 H (0..=255), S, V
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRange {
    pub low: [u8; 3],
    pub high: [u8; 3],
}

impl ColorRange {
    pub fn new(low: [u8; 3], high: [u8; 3]) -> Self {
        Self { low, high }
    }

    #[inline]
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|c| self.low[c] <= hsv[c] && hsv[c] <= self.high[c])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorParams {
    pub ranges: Vec<ColorRange>,
    #[serde(default = "default_min_area")]
    pub min_contour_area: f64,
    #[serde(default = "default_max_area")]
    pub max_contour_area: f64,
}

fn default_min_area() -> f64 {
    100.0
}

fn default_max_area() -> f64 {
    1.0e7
}

impl ColorParams {
    pub fn new(ranges: Vec<ColorRange>) -> Self {
        Self {
            ranges,
            min_contour_area: default_min_area(),
            max_contour_area: default_max_area(),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.ranges.is_empty() {
            return Err(PipelineError::Configuration(
                "color detection needs at least one range".into(),
            ));
        }
        for (i, range) in self.ranges.iter().enumerate() {
            if (0..3).any(|c| range.low[c] > range.high[c]) {
                return Err(PipelineError::Configuration(format!(
                    "color range {i}: low {:?} exceeds high {:?}",
                    range.low, range.high
                )));
            }
        }
        if !(self.min_contour_area >= 0.0 && self.min_contour_area <= self.max_contour_area) {
            return Err(PipelineError::Configuration(format!(
                "invalid contour area bounds [{}, {}]",
                self.min_contour_area, self.max_contour_area
            )));
        }
        Ok(())
    }
}

/// 颜色区间检测器
#[derive(Debug, Default)]
pub struct ColorRangeDetector {
    params: Option<ColorParams>,
    partition: PartitionParams,
    min_height: i32,
    min_width: i32,
    last_error: ErrorDetails,
}

impl ColorRangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(
        &mut self,
        params: ColorParams,
        partition: PartitionParams,
        min_height: i32,
        min_width: i32,
    ) -> Result<(), PipelineError> {
        let checked = params.validate().and_then(|_| partition.validate());
        if let Err(err) = &checked {
            self.params = None;
            self.record(Err(err));
            return checked;
        }
        self.params = Some(params);
        self.partition = partition;
        self.min_height = min_height;
        self.min_width = min_width;
        self.record(Ok(()));
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.params.is_some()
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

    pub fn detect(&mut self, image: &RgbImage) -> Result<ColorResult, PipelineError> {
        let Some(params) = self.params.as_ref() else {
            let err = PipelineError::BackendNotSelected("color backend is not configured".into());
            self.record(Err(&err));
            return Err(err);
        };

        let mut result = ColorResult::default();
        let mut total_area = 0.0;
        let mut scanned = 0u64;
        for strip in partition::plan(image.width(), &self.partition) {
            let view = partition::crop(image, strip);
            scanned += u64::from(view.width()) * u64::from(view.height());

            let mask = close(&in_range_mask(&view, &params.ranges), Norm::LInf, CLOSE_RADIUS);
            for contour in find_contours::<i32>(&mask) {
                if contour.border_type != BorderType::Outer || contour.parent.is_some() {
                    continue;
                }
                let area = contour_area(&contour.points);
                if area < params.min_contour_area || area > params.max_contour_area {
                    trace!(area, "轮廓面积超出范围");
                    continue;
                }
                let rect = bounding_rect(&contour.points);
                if rect.width >= self.min_width && rect.height > self.min_height {
                    total_area += area;
                    result.push(rect.translate_x(strip.offset()));
                }
            }
        }
        if scanned > 0 {
            result.area_factor = (total_area / scanned as f64) as f32;
        }
        self.record(Ok(()));
        Ok(result)
    }
}

/// 8 位 RGB → HSV, H 按 0..=255 表示整圈
pub fn rgb_to_hsv_full([r, g, b]: [u8; 3]) -> [u8; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let v = max;
    if max == 0 {
        return [0, 0, 0];
    }
    let diff = f32::from(max - min);
    let s = (diff * 255.0 / f32::from(max)).round() as u8;
    if diff == 0.0 {
        return [0, s, v];
    }
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let mut h = if max as f32 == r {
        60.0 * (g - b) / diff
    } else if max as f32 == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    let h = ((h * 256.0 / 360.0).round() as u32 % 256) as u8;
    [h, s, v]
}

/// 各区间掩码的并集, 命中为 255
pub fn in_range_mask(image: &RgbImage, ranges: &[ColorRange]) -> GrayImage {
    let mut mask = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let hsv = rgb_to_hsv_full(pixel.0);
        if ranges.iter().any(|r| r.contains(hsv)) {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

/// 多边形面积 (鞋带公式)
pub fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(p, q)| i64::from(p.x) * i64::from(q.y) - i64::from(q.x) * i64::from(p.y))
        .sum();
    twice.abs() as f64 / 2.0
}

/// 外接矩形 (含端点像素)
pub fn bounding_rect(points: &[Point<i32>]) -> Region {
    let Some(first) = points.first() else {
        return Region::default();
    };
    let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
    for p in points {
        x0 = x0.min(p.x);
        y0 = y0.min(p.y);
        x1 = x1.max(p.x);
        y1 = y1.max(p.y);
    }
    Region::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn red_range() -> ColorParams {
        ColorParams::new(vec![ColorRange::new([0, 100, 100], [10, 255, 255])])
    }

    fn image_with_square(x: i32, y: i32, side: u32) -> RgbImage {
        let mut image = RgbImage::new(200, 100);
        draw_filled_rect_mut(
            &mut image,
            Rect::at(x, y).of_size(side, side),
            Rgb([255, 0, 0]),
        );
        image
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(rgb_to_hsv_full([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv_full([0, 255, 0]), [85, 255, 255]);
        assert_eq!(rgb_to_hsv_full([0, 0, 255]), [171, 255, 255]);
        assert_eq!(rgb_to_hsv_full([0, 0, 0]), [0, 0, 0]);
        assert_eq!(rgb_to_hsv_full([128, 128, 128]), [0, 0, 128]);
    }

    #[test]
    fn shoelace_area_of_square_outline() {
        let points = vec![
            Point::new(0, 0),
            Point::new(9, 0),
            Point::new(9, 9),
            Point::new(0, 9),
        ];
        assert_eq!(contour_area(&points), 81.0);
        assert_eq!(bounding_rect(&points), Region::new(0, 0, 10, 10));
    }

    #[test]
    fn finds_single_red_square() {
        let mut detector = ColorRangeDetector::new();
        detector
            .configure(red_range(), PartitionParams::default(), 0, 0)
            .unwrap();
        let result = detector.detect(&image_with_square(20, 20, 40)).unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.regions[0], Region::new(20, 20, 40, 40));
        assert!(result.area_factor > 0.0);
        assert!(detector.last_error().is_ok());
    }

    #[test]
    fn size_filters_apply() {
        let image = image_with_square(20, 20, 40);

        let mut detector = ColorRangeDetector::new();
        let mut params = red_range();
        params.min_contour_area = 5000.0;
        detector
            .configure(params, PartitionParams::default(), 0, 0)
            .unwrap();
        assert_eq!(detector.detect(&image).unwrap().count, 0);

        // 高度必须严格大于下限, 宽度允许相等
        let mut detector = ColorRangeDetector::new();
        detector
            .configure(red_range(), PartitionParams::default(), 40, 40)
            .unwrap();
        assert_eq!(detector.detect(&image).unwrap().count, 0);
        detector
            .configure(red_range(), PartitionParams::default(), 39, 40)
            .unwrap();
        assert_eq!(detector.detect(&image).unwrap().count, 1);
    }

    #[test]
    fn partition_translates_regions() {
        let mut detector = ColorRangeDetector::new();
        detector
            .configure(red_range(), PartitionParams::strips(2, [1]), 0, 0)
            .unwrap();
        let result = detector.detect(&image_with_square(120, 30, 30)).unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.regions[0].x, 120);

        // 左半部分的目标不在检测范围内
        let result = detector.detect(&image_with_square(20, 30, 30)).unwrap();
        assert_eq!(result.count, 0);
    }

    #[test]
    fn invalid_params_fail_closed() {
        let mut detector = ColorRangeDetector::new();
        let err = detector
            .configure(
                ColorParams::new(vec![]),
                PartitionParams::default(),
                0,
                0,
            )
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ConfigurationError);
        assert!(!detector.is_configured());

        let inverted = ColorParams::new(vec![ColorRange::new([10, 0, 0], [0, 255, 255])]);
        assert!(detector
            .configure(inverted, PartitionParams::default(), 0, 0)
            .is_err());

        let err = detector.detect(&RgbImage::new(10, 10)).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::BackendNotSelected);
    }
}
