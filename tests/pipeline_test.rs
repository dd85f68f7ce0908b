//! 端到端流水线测试: 通过自定义 EngineLoader 注入可控的推理引擎

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::{Rgb, RgbImage};
use netravision_rs::pipeline::stage::StageState;
use netravision_rs::pipeline::StagePayload;
use netravision_rs::{
    Backpressure, BackendKind, Bbox, ColorParams, ColorRange, DetectionParams, EngineLoader,
    EngineSpec, ErrorCode, ImageServiceParams, InferenceEngine, Orchestrator, PartitionParams,
    PipelineConfig, StageKind, StageOutcome,
};

/// 失败标记: 左上角像素为该颜色时引擎报错
const FAIL_MARKER: Rgb<u8> = Rgb([1, 2, 3]);

struct MockEngine {
    boxes: Vec<Bbox>,
    delay_ms: Arc<AtomicU64>,
}

impl InferenceEngine for MockEngine {
    fn forward(&mut self, image: &RgbImage) -> anyhow::Result<Vec<Bbox>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if image.get_pixel(0, 0) == &FAIL_MARKER {
            anyhow::bail!("corrupted frame");
        }
        Ok(self.boxes.clone())
    }
}

#[derive(Clone)]
struct MockLoader {
    boxes: Vec<Bbox>,
    delay_ms: Arc<AtomicU64>,
}

impl MockLoader {
    fn new(boxes: Vec<Bbox>) -> Self {
        Self {
            boxes,
            delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn with_delay(self, ms: u64) -> Self {
        self.delay_ms.store(ms, Ordering::SeqCst);
        self
    }
}

impl EngineLoader for MockLoader {
    fn load(&self, spec: &EngineSpec) -> anyhow::Result<Box<dyn InferenceEngine>> {
        assert!(spec.weights_file.is_file());
        Ok(Box::new(MockEngine {
            boxes: self.boxes.clone(),
            delay_ms: Arc::clone(&self.delay_ms),
        }))
    }
}

struct ModelFiles {
    dir: tempfile::TempDir,
}

impl ModelFiles {
    fn new(names: &str, classes: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model.cfg"),
            format!("[net]\nwidth=416\nheight=416\nchannels=3\n\n[yolo]\nclasses={classes}\n"),
        )
        .unwrap();
        fs::write(dir.path().join("model.weights"), [0u8; 16]).unwrap();
        fs::write(dir.path().join("model.names"), names).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn params(&self) -> DetectionParams {
        DetectionParams {
            cfg_file: self.path("model.cfg"),
            names_file: self.path("model.names"),
            weights_file: self.path("model.weights"),
            nms: 0.45,
            thresh: 0.5,
            hier_thresh: 0.5,
            input_size: 416,
        }
    }
}

fn three_classes() -> ModelFiles {
    ModelFiles::new("person\ncar\ndog\n", 3)
}

fn orchestrator(config: PipelineConfig, loader: MockLoader) -> Orchestrator {
    Orchestrator::with_engine_loader(config, Arc::new(loader)).unwrap()
}

fn red_params() -> ColorParams {
    ColorParams::new(vec![ColorRange::new([0, 100, 100], [10, 255, 255])])
}

fn failing_frame() -> RgbImage {
    let mut image = RgbImage::new(64, 64);
    image.put_pixel(0, 0, FAIL_MARKER);
    image
}

#[test]
fn detection_only_reports_known_classes() {
    let files = three_classes();
    let loader = MockLoader::new(vec![
        Bbox::new(10., 10., 20., 20., 0, 0.9),
        Bbox::new(100., 10., 20., 20., 2, 0.8),
        Bbox::new(200., 10., 20., 20., 5, 0.99),
        Bbox::new(300., 10., 20., 20., 1, 0.2),
    ]);
    let mut orchestrator = orchestrator(PipelineConfig::default(), loader);
    orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap();
    assert_eq!(
        orchestrator.stage_state(StageKind::Detection),
        Some(StageState::Running)
    );

    let outcome = orchestrator.submit_frame(RgbImage::new(400, 100), true, false);
    assert_eq!(outcome.color, StageOutcome::NotRequested);
    let result = outcome.detection.completed().expect("detection completed");
    assert_eq!(result.count, 2);
    assert!(result.class_ids().all(|id| id < 3));
}

#[test]
fn results_reach_their_own_session() {
    let files = three_classes();
    let loader = MockLoader::new(vec![Bbox::new(10., 10., 20., 20., 1, 0.9)]).with_delay(200);
    let mut orchestrator = orchestrator(PipelineConfig::default(), loader);
    orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap();
    orchestrator
        .configure_color(
            BackendKind::ColorInRange,
            red_params(),
            PartitionParams::default(),
            0,
            0,
        )
        .unwrap();

    // 会话 1 走慢速检测, 会话 2 只做颜色检测并先完成
    let first = orchestrator.dispatch(RgbImage::new(100, 100), true, false);
    let second = orchestrator.dispatch(RgbImage::new(100, 100), false, true);
    assert_eq!(first.session(), 1);
    assert_eq!(second.session(), 2);

    let second = orchestrator.collect(second);
    assert_eq!(second.session, 2);
    assert!(second.color.is_completed());
    assert_eq!(second.detection, StageOutcome::NotRequested);

    let first = orchestrator.collect(first);
    assert_eq!(first.session, 1);
    assert_eq!(first.detection.completed().map(|r| r.count), Some(1));
}

#[test]
fn out_of_order_collection_uses_stash() {
    let files = three_classes();
    let loader = MockLoader::new(vec![Bbox::new(10., 10., 20., 20., 0, 0.9)]).with_delay(30);
    let mut orchestrator = orchestrator(PipelineConfig::default(), loader);
    orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap();

    let first = orchestrator.dispatch(RgbImage::new(50, 50), true, false);
    let second = orchestrator.dispatch(failing_frame(), true, false);

    // 先收集会话 2: 会话 1 的结果被暂存
    let second = orchestrator.collect(second);
    assert_eq!(second.session, 2);
    assert_eq!(
        second.detection.error().map(|e| e.code()),
        Some(ErrorCode::DetectionError)
    );

    let first = orchestrator.collect(first);
    assert_eq!(first.session, 1);
    assert!(first.detection.is_completed());
}

#[test]
fn partition_translates_to_full_frame() {
    let files = three_classes();
    let loader = MockLoader::new(vec![Bbox::new(10., 5., 20., 20., 0, 0.9)]);
    let mut orchestrator = orchestrator(PipelineConfig::default(), loader);
    orchestrator
        .configure_detection(
            BackendKind::Darknet,
            files.params(),
            PartitionParams::strips(2, [1]),
        )
        .unwrap();

    let outcome = orchestrator.submit_frame(RgbImage::new(200, 100), true, false);
    let result = outcome.detection.completed().expect("detection completed");
    let (_, region, _) = result.iter().next().unwrap();
    assert_eq!(region.x, 110);
    assert_eq!(region.y, 5);
}

#[test]
fn missing_weights_never_start_the_stage() {
    let files = three_classes();
    let mut params = files.params();
    params.weights_file = files.path("absent.weights");

    let mut orchestrator = orchestrator(PipelineConfig::default(), MockLoader::new(vec![]));
    let err = orchestrator
        .configure_detection(BackendKind::Darknet, params, PartitionParams::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileNotFound);
    assert!(err.to_string().contains("absent.weights"));
    assert!(orchestrator.stage_state(StageKind::Detection).is_none());
    assert!(orchestrator.detection_config().is_none());

    let outcome = orchestrator.submit_frame(RgbImage::new(10, 10), true, false);
    assert_eq!(
        outcome.detection.error().map(|e| e.code()),
        Some(ErrorCode::BackendNotSelected)
    );
}

#[test]
fn class_count_mismatch_is_a_configuration_error() {
    let files = ModelFiles::new("person\ncar\ndog\n", 80);
    let mut orchestrator = orchestrator(PipelineConfig::default(), MockLoader::new(vec![]));
    let err = orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}

#[test]
fn frame_error_does_not_poison_next_frame() {
    let files = three_classes();
    let loader = MockLoader::new(vec![Bbox::new(10., 10., 20., 20., 2, 0.9)]);
    let mut orchestrator = orchestrator(PipelineConfig::default(), loader);
    orchestrator
        .configure_detection(BackendKind::Onnx, files.params(), PartitionParams::default())
        .unwrap();

    let bad = orchestrator.submit_frame(failing_frame(), true, false);
    let err = bad.detection.error().expect("detection failed");
    assert_eq!(err.code(), ErrorCode::DetectionError);
    assert!(err.to_string().contains("corrupted frame"));

    let good = orchestrator.submit_frame(RgbImage::new(64, 64), true, false);
    assert_eq!(good.detection.completed().map(|r| r.count), Some(1));
    assert_eq!(
        orchestrator
            .stage_report(StageKind::Detection)
            .map(|r| (r.processed, r.failed)),
        Some((2, 1))
    );
}

#[test]
fn late_results_for_abandoned_sessions_are_discarded() {
    let files = three_classes();
    let loader = MockLoader::new(vec![Bbox::new(10., 10., 20., 20., 0, 0.9)]).with_delay(300);
    let delay = Arc::clone(&loader.delay_ms);
    let config = PipelineConfig {
        result_timeout_ms: 100,
        ..Default::default()
    };
    let mut orchestrator = orchestrator(config, loader);
    orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap();

    let first = orchestrator.submit_frame(RgbImage::new(32, 32), true, false);
    assert_eq!(first.detection, StageOutcome::TimedOut);

    // 会话 1 的结果稍后到达, 不得被当作会话 2 的结果
    delay.store(0, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(400));
    let second = orchestrator.submit_frame(RgbImage::new(32, 32), true, false);
    assert_eq!(second.session, 2);
    assert!(second.detection.is_completed());
}

#[test]
fn full_input_drops_frames_under_drop_policy() {
    let files = three_classes();
    let loader = MockLoader::new(vec![]).with_delay(200);
    let config = PipelineConfig {
        input_capacity: 2,
        backpressure: Backpressure::Drop,
        ..Default::default()
    };
    let mut orchestrator = orchestrator(config, loader);
    orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap();

    let tickets: Vec<_> = (0..3)
        .map(|_| orchestrator.dispatch(RgbImage::new(16, 16), true, false))
        .collect();
    let outcomes: Vec<_> = tickets
        .into_iter()
        .map(|t| orchestrator.collect(t))
        .collect();

    assert!(outcomes[0].detection.is_completed());
    let dropped = outcomes
        .iter()
        .filter(|o| o.detection == StageOutcome::Dropped)
        .count();
    assert!(dropped >= 1, "expected at least one dropped frame");
    assert!(outcomes
        .iter()
        .all(|o| o.detection.is_completed() || o.detection == StageOutcome::Dropped));
}

#[test]
fn retry_policy_waits_for_space() {
    let files = three_classes();
    let loader = MockLoader::new(vec![]).with_delay(20);
    let config = PipelineConfig {
        input_capacity: 2,
        backpressure: Backpressure::Retry {
            attempts: 50,
            interval_ms: 10,
        },
        ..Default::default()
    };
    let mut orchestrator = orchestrator(config, loader);
    orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap();

    let tickets: Vec<_> = (0..3)
        .map(|_| orchestrator.dispatch(RgbImage::new(16, 16), true, false))
        .collect();
    for ticket in tickets {
        let outcome = orchestrator.collect(ticket);
        assert!(outcome.detection.is_completed(), "{}", outcome.error_message());
    }
}

#[test]
fn shutdown_releases_queued_frames() {
    let files = three_classes();
    let loader = MockLoader::new(vec![]).with_delay(200);
    let mut orchestrator = orchestrator(PipelineConfig::default(), loader);
    orchestrator
        .configure_detection(BackendKind::Darknet, files.params(), PartitionParams::default())
        .unwrap();

    let _tickets: Vec<_> = (0..3)
        .map(|_| orchestrator.dispatch(RgbImage::new(16, 16), true, false))
        .collect();
    let reports = orchestrator.shutdown();
    assert_eq!(reports.len(), 1);
    let report = reports[0];
    assert_eq!(report.stage, StageKind::Detection);
    assert_eq!(report.processed + report.released_frames, 3);
    assert!(report.released_frames >= 2);
    assert!(orchestrator.stage_state(StageKind::Detection).is_none());
}

#[test]
fn image_services_write_files_with_service_session() {
    let out = tempfile::tempdir().unwrap();
    let mut orchestrator = orchestrator(PipelineConfig::default(), MockLoader::new(vec![]));
    orchestrator
        .configure_image_service(ImageServiceParams {
            save_dir: Some(out.path().join("raw")),
            extension: "png".into(),
            ..Default::default()
        })
        .unwrap();

    orchestrator.set_session_number(17);
    let outcome = orchestrator.submit_frame(RgbImage::new(8, 8), false, false);
    assert_eq!(outcome.session, 1);

    let mut acks = Vec::new();
    for _ in 0..500 {
        acks.extend(orchestrator.poll_service_reports());
        if !acks.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].session, 17);
    assert_eq!(acks[0].stage, StageKind::Save);
    assert_eq!(acks[0].outcome, Ok(StagePayload::Ack));

    let names: Vec<_> = fs::read_dir(out.path().join("raw"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("17_"));
}
