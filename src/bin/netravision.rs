/// NetraVision 批量检测 (Batch Driver)
///
/// 流程:
/// 1. 加载 JSON 配置, 配置图像服务 / 目标检测 / 颜色检测阶段
/// 2. 遍历图片目录, 逐张提交 (会话号 = 图片序号)
/// 3. 输出每帧结果与耗时, 可选写出标注图
/// 4. 关闭流水线, 打印各阶段统计
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netravision_rs::{FrameOutcome, NetraConfig, Orchestrator, Region};

/// NetraVision 参数
#[derive(Parser, Debug)]
#[command(author, version, about = "NetraVision - 多阶段图像检测流水线", long_about = None)]
struct Args {
    /// 配置文件 (不存在时写出默认配置)
    #[arg(short, long, default_value = "netravision.json")]
    config: PathBuf,

    /// 图片目录 (jpg / png)
    #[arg(short, long, default_value = "images")]
    images: PathBuf,

    /// 最多处理的图片数
    #[arg(short, long, default_value_t = 50)]
    limit: usize,

    /// 跳过目标检测
    #[arg(long)]
    no_detect: bool,

    /// 跳过颜色检测
    #[arg(long)]
    no_color: bool,

    /// 标注图输出目录
    #[arg(long)]
    annotate: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    let config = NetraConfig::load(&args.config);
    let mut orchestrator = Orchestrator::new(config.pipeline.clone())?;

    // ========== 配置阶段 ==========
    if let Some(service) = config.image_service.clone() {
        if let Err(e) = orchestrator.configure_image_service(service) {
            error!(code = %e.code(), error = %e, "图像服务配置失败");
        }
    }
    if let Some(det) = config.detection.clone() {
        if let Err(e) = orchestrator.configure_detection(det.kind, det.params, det.partition) {
            error!(code = %e.code(), error = %e, "目标检测配置失败");
        }
    }
    if let Some(color) = config.color.clone() {
        if let Err(e) = orchestrator.configure_color(
            color.kind,
            color.params,
            color.partition,
            color.min_height,
            color.min_width,
        ) {
            error!(code = %e.code(), error = %e, "颜色检测配置失败");
        }
    }

    let run_detection = !args.no_detect && orchestrator.detection_config().is_some();
    let run_color = !args.no_color && orchestrator.color_config().is_some();
    if !run_detection && !run_color {
        warn!("没有可用的检测阶段, 仅运行图像服务");
    }

    if let Some(dir) = &args.annotate {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    // ========== 逐张提交 ==========
    let paths = list_images(&args.images, args.limit)?;
    info!(count = paths.len(), dir = %args.images.display(), "开始处理");

    let (mut objects, mut regions) = (0usize, 0usize);
    for (index, path) in paths.iter().enumerate() {
        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "图片读取失败, 跳过");
                continue;
            }
        };

        orchestrator.set_session_number(index as u64);
        let start = Instant::now();
        let outcome = orchestrator.submit_frame(image.clone(), run_detection, run_color);
        let elapsed = start.elapsed();

        log_outcome(path, &outcome, elapsed.as_secs_f64() * 1000.0);
        if let Some(result) = outcome.detection.completed() {
            objects += result.count;
        }
        if let Some(result) = outcome.color.completed() {
            regions += result.count;
        }

        if let Some(dir) = &args.annotate {
            let mut canvas = image;
            if let Some(result) = outcome.detection.completed() {
                for (_, region, _) in result.iter() {
                    draw_region(&mut canvas, region, Rgb([0, 255, 0]));
                }
            }
            if let Some(result) = outcome.color.completed() {
                for region in &result.regions {
                    draw_region(&mut canvas, region, Rgb([0, 0, 255]));
                }
            }
            let file_name = path.file_name().map(PathBuf::from).unwrap_or_else(|| {
                PathBuf::from(format!("{index}.png"))
            });
            let out = dir.join(file_name);
            if let Err(e) = canvas.save(&out) {
                warn!(path = %out.display(), error = %e, "标注图保存失败");
            }
        }

        for report in orchestrator.poll_service_reports() {
            if let Err(e) = &report.outcome {
                warn!(stage = %report.stage, session = report.session, error = %e, "图像服务失败");
            }
        }
    }

    // ========== 关闭 ==========
    for report in orchestrator.shutdown() {
        info!(%report, "阶段统计");
    }
    info!(objects, regions, "处理完成");
    Ok(())
}

fn list_images(dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("failed to read image directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    paths.sort();
    paths.truncate(limit);
    Ok(paths)
}

fn log_outcome(path: &Path, outcome: &FrameOutcome, ms: f64) {
    let detected = outcome.detection.completed().map(|r| r.count);
    let colored = outcome.color.completed().map(|r| r.count);
    if outcome.is_success() {
        info!(
            session = outcome.session,
            image = %path.display(),
            objects = ?detected,
            regions = ?colored,
            ms = %format!("{ms:.1}"),
            "帧处理完成"
        );
    } else {
        warn!(
            session = outcome.session,
            image = %path.display(),
            error = %outcome.error_message(),
            "帧处理未完成"
        );
    }
}

fn draw_region(canvas: &mut image::RgbImage, region: &Region, color: Rgb<u8>) {
    if region.width > 0 && region.height > 0 {
        draw_hollow_rect_mut(
            canvas,
            Rect::at(region.x, region.y).of_size(region.width as u32, region.height as u32),
            color,
        );
    }
}
