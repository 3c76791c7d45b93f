// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理阶段: RawBuffer → (StatusRegistry, FrameSlot)
//!
//! 每 N 帧处理一帧: 缩放 → 车位模型 + 目标模型 → 绘制 → 更新车位状态 → JPEG → 发布.
//! 单帧的推理或编码失败只影响当前周期.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{debug, info, warn};

use super::annotate::{Annotator, EMPTY_COLOR, OCCUPIED_COLOR, PERSON_COLOR};
use super::encode::encode_jpeg;
use super::{
    AnnotatedFrame, FrameSlot, OccupancyStatus, PipelineStats, RawBuffer, Shutdown, StatusRegistry,
};
use crate::config::PipelineConfig;
use crate::detection::Detection;
use crate::input::{resize_rgb, Frame};
use crate::models::DetectionModel;

const OCCUPIED: &str = "occupied";
const EMPTY: &str = "empty";
const PERSON: &str = "person";

/// 等待原始帧的超时, 到期后检查退出标志
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 单个周期的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 被抽帧跳过
    Skipped,
    /// 已更新状态并发布新帧
    Published { seq: u64, status: OccupancyStatus },
    InferenceFailed,
    EncodeFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct InferenceSettings {
    pub frame_skip: u64,
    pub width: u32,
    pub height: u32,
    pub shift_x: i32,
    pub shift_y: i32,
    pub jpeg_quality: u8,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl InferenceSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            frame_skip: config.frame_skip.max(1),
            width: config.processing_width,
            height: config.processing_height,
            shift_x: config.shift_x,
            shift_y: config.shift_y,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

pub struct InferenceStage {
    occupancy: Box<dyn DetectionModel>,
    objects: Box<dyn DetectionModel>,
    annotator: Annotator,
    settings: InferenceSettings,
    status: Arc<StatusRegistry>,
    output: FrameSlot,
    stats: Arc<PipelineStats>,
    counter: u64,
}

impl InferenceStage {
    pub fn new(
        occupancy: Box<dyn DetectionModel>,
        objects: Box<dyn DetectionModel>,
        annotator: Annotator,
        settings: InferenceSettings,
        status: Arc<StatusRegistry>,
        output: FrameSlot,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            occupancy,
            objects,
            annotator,
            settings: InferenceSettings {
                frame_skip: settings.frame_skip.max(1),
                ..settings
            },
            status,
            output,
            stats,
            counter: 0,
        }
    }

    /// 处理一帧 (含抽帧判断)
    pub fn process(&mut self, frame: Frame) -> CycleOutcome {
        self.counter += 1;
        if self.counter % self.settings.frame_skip != 0 {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return CycleOutcome::Skipped;
        }

        let Frame { image, seq } = frame;
        let mut canvas = match resize_rgb(image, self.settings.width, self.settings.height) {
            Ok(img) => img,
            Err(e) => {
                warn!("帧 #{} 缩放失败: {:#}", seq, e);
                self.stats.inference_failures.fetch_add(1, Ordering::Relaxed);
                return CycleOutcome::InferenceFailed;
            }
        };

        let t = Instant::now();
        let detections = self
            .occupancy
            .infer(&canvas)
            .and_then(|spaces| Ok((spaces, self.objects.infer(&canvas)?)));
        let (spaces, objects) = match detections {
            Ok(d) => d,
            Err(e) => {
                warn!("帧 #{} 推理失败: {:#}", seq, e);
                self.stats.inference_failures.fetch_add(1, Ordering::Relaxed);
                return CycleOutcome::InferenceFailed;
            }
        };
        self.stats.record_inference(t.elapsed());

        let status = self.annotate(&mut canvas, &spaces, &objects);
        self.status.update(status);

        let jpeg = match encode_jpeg(&canvas, self.settings.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("帧 #{} 编码失败: {:#}", seq, e);
                self.stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                return CycleOutcome::EncodeFailed;
            }
        };
        self.output.publish(AnnotatedFrame {
            seq,
            jpeg: Arc::new(jpeg),
        });
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        CycleOutcome::Published { seq, status }
    }

    /// 绘制车位与行人, 返回本帧的车位统计
    pub fn annotate(
        &self,
        canvas: &mut RgbImage,
        spaces: &[Detection],
        objects: &[Detection],
    ) -> OccupancyStatus {
        let (sx, sy) = (self.settings.shift_x, self.settings.shift_y);
        let mut status = OccupancyStatus::default();

        for det in spaces {
            let color = if det.is(OCCUPIED) {
                status.parked_cars += 1;
                OCCUPIED_COLOR
            } else if det.is(EMPTY) {
                status.available_spaces += 1;
                EMPTY_COLOR
            } else {
                continue;
            };
            let corners = det.bbox.corners().shifted(sx, sy);
            self.annotator.draw(canvas, corners, &det.label, color);
        }

        // 目标模型只画行人, 不参与计数
        for det in objects.iter().filter(|d| d.is(PERSON)) {
            let corners = det.bbox.corners().shifted(sx, sy);
            self.annotator.draw(canvas, corners, &det.label, PERSON_COLOR);
        }

        status
    }

    /// 运行到退出信号; 每秒输出一次吞吐统计
    pub fn run(mut self, buffer: RawBuffer, shutdown: Shutdown) {
        info!(
            "推理线程启动 (每 {} 帧推理一次, 处理分辨率 {}x{})",
            self.settings.frame_skip, self.settings.width, self.settings.height
        );

        let mut last = Instant::now();
        let mut published = self.stats.published.load(Ordering::Relaxed);
        let mut dropped = self.stats.dropped.load(Ordering::Relaxed);

        while !shutdown.is_triggered() {
            let Some(frame) = buffer.take(POLL_INTERVAL) else {
                continue;
            };
            if let CycleOutcome::Published { seq, status } = self.process(frame) {
                debug!(
                    seq,
                    parked = status.parked_cars,
                    available = status.available_spaces,
                    "cycle published"
                );
            }

            if last.elapsed() >= Duration::from_secs(1) {
                let now_published = self.stats.published.load(Ordering::Relaxed);
                let now_dropped = self.stats.dropped.load(Ordering::Relaxed);
                let fps = (now_published - published) as f64 / last.elapsed().as_secs_f64();
                info!(
                    fps = %format_args!("{:.1}", fps),
                    infer_ms = %format_args!("{:.1}", self.stats.last_inference_ms()),
                    dropped = now_dropped - dropped,
                    queued = buffer.len(),
                    "inference throughput"
                );
                published = now_published;
                dropped = now_dropped;
                last = Instant::now();
            }
        }
        debug!("推理线程退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Bbox;
    use anyhow::{bail, Result};
    use image::Rgb;
    use std::sync::atomic::AtomicUsize;

    /// 每次返回固定检测结果, 可配置前几次调用失败
    struct FakeModel {
        detections: Vec<Detection>,
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        names: Vec<String>,
    }

    impl FakeModel {
        fn new(detections: Vec<Detection>) -> Self {
            Self {
                detections,
                calls: Arc::new(AtomicUsize::new(0)),
                fail_first: 0,
                names: vec![],
            }
        }
    }

    impl DetectionModel for FakeModel {
        fn infer(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                bail!("session run failed");
            }
            Ok(self.detections.clone())
        }

        fn names(&self) -> &[String] {
            &self.names
        }
    }

    fn det(label: &str, cx: f32, cy: f32) -> Detection {
        Detection::new(0, label, 0.9, Bbox::from_cxcywh(cx, cy, 40.0, 40.0))
    }

    fn stage(
        occupancy: FakeModel,
        objects: FakeModel,
        frame_skip: u64,
    ) -> (InferenceStage, Arc<StatusRegistry>, FrameSlot) {
        let status = Arc::new(StatusRegistry::new());
        let slot = FrameSlot::new();
        let settings = InferenceSettings {
            frame_skip,
            ..Default::default()
        };
        let stage = InferenceStage::new(
            Box::new(occupancy),
            Box::new(objects),
            Annotator::with_font(None),
            settings,
            status.clone(),
            slot.clone(),
            Arc::new(PipelineStats::default()),
        );
        (stage, status, slot)
    }

    fn frame(seq: u64) -> Frame {
        Frame {
            image: RgbImage::new(640, 360),
            seq,
        }
    }

    #[test]
    fn test_frame_skip_three_cycles_one_inference() {
        let occupancy = FakeModel::new(vec![det("occupied", 200.0, 200.0)]);
        let calls = occupancy.calls.clone();
        let (mut stage, status, slot) = stage(occupancy, FakeModel::new(vec![]), 3);
        let mut sub = slot.subscribe();

        assert_eq!(stage.process(frame(1)), CycleOutcome::Skipped);
        assert_eq!(stage.process(frame(2)), CycleOutcome::Skipped);
        assert!(sub.try_next().is_none());
        assert_eq!(status.read(), OccupancyStatus::default());

        assert_eq!(
            stage.process(frame(3)),
            CycleOutcome::Published {
                seq: 3,
                status: OccupancyStatus::new(1, 0)
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(status.read(), OccupancyStatus::new(1, 0));
        assert_eq!(sub.try_next().map(|f| f.seq), Some(3));
    }

    #[test]
    fn test_every_nth_cycle_reaches_inference() {
        for n in 1..=5u64 {
            let occupancy = FakeModel::new(vec![]);
            let calls = occupancy.calls.clone();
            let (mut stage, _, _) = stage(occupancy, FakeModel::new(vec![]), n);
            let outcomes: Vec<bool> = (1..=20)
                .map(|i| stage.process(frame(i)) != CycleOutcome::Skipped)
                .collect();
            for (i, processed) in outcomes.iter().enumerate() {
                assert_eq!(*processed, (i as u64 + 1) % n == 0, "n={n} cycle={}", i + 1);
            }
            assert_eq!(calls.load(Ordering::SeqCst) as u64, 20 / n);
        }
    }

    #[test]
    fn test_mixed_case_labels_counted() {
        let occupancy = FakeModel::new(vec![
            det("Occupied", 150.0, 150.0),
            det("Occupied", 250.0, 150.0),
            det("empty", 350.0, 150.0),
            det("empty", 450.0, 150.0),
            det("empty", 550.0, 150.0),
            det("unknown", 550.0, 250.0),
        ]);
        let (mut stage, status, _) = stage(occupancy, FakeModel::new(vec![]), 1);
        stage.process(frame(1));
        assert_eq!(status.read(), OccupancyStatus::new(2, 3));
        assert_eq!(
            serde_json::to_string(&status.read()).unwrap(),
            r#"{"parked_cars":2,"available_spaces":3}"#
        );
    }

    #[test]
    fn test_only_person_drawn_from_object_model() {
        let objects = vec![det("person", 150.0, 150.0), det("car", 300.0, 200.0)];
        let (stage, _, _) = stage(FakeModel::new(vec![]), FakeModel::new(vec![]), 1);

        let mut canvas = RgbImage::new(640, 360);
        let status = stage.annotate(&mut canvas, &[], &objects);
        assert_eq!(status, OccupancyStatus::default());

        // person: (130,130)-(170,170) 偏移 100 后为 (30,30)-(70,70)
        assert_eq!(*canvas.get_pixel(30, 50), PERSON_COLOR);
        // car: (280,180)-(320,220) → (180,80)-(220,120), 不应绘制
        assert_eq!(*canvas.get_pixel(180, 100), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_occupancy_colors() {
        let (stage, _, _) = stage(FakeModel::new(vec![]), FakeModel::new(vec![]), 1);
        let mut canvas = RgbImage::new(640, 360);
        stage.annotate(
            &mut canvas,
            &[det("occupied", 150.0, 150.0), det("EMPTY", 250.0, 150.0)],
            &[],
        );
        assert_eq!(*canvas.get_pixel(30, 50), OCCUPIED_COLOR);
        assert_eq!(*canvas.get_pixel(130, 50), EMPTY_COLOR);
    }

    #[test]
    fn test_idempotent_all_empty() {
        let occupancy = FakeModel::new(
            (0..4)
                .map(|i| det("empty", 150.0 + 100.0 * i as f32, 200.0))
                .collect(),
        );
        let (mut stage, status, _) = stage(occupancy, FakeModel::new(vec![]), 1);
        for i in 1..=5 {
            stage.process(frame(i));
            assert_eq!(status.read(), OccupancyStatus::new(0, 4));
        }
    }

    #[test]
    fn test_inference_failure_is_isolated() {
        let mut occupancy = FakeModel::new(vec![det("occupied", 200.0, 200.0)]);
        occupancy.fail_first = 1;
        let (mut stage, status, slot) = stage(occupancy, FakeModel::new(vec![]), 1);
        status.update(OccupancyStatus::new(5, 5));
        let mut sub = slot.subscribe();

        assert_eq!(stage.process(frame(1)), CycleOutcome::InferenceFailed);
        assert_eq!(status.read(), OccupancyStatus::new(5, 5));
        assert!(sub.try_next().is_none());

        assert!(matches!(stage.process(frame(2)), CycleOutcome::Published { .. }));
        assert_eq!(status.read(), OccupancyStatus::new(1, 0));
        assert_eq!(sub.try_next().map(|f| f.seq), Some(2));
    }

    #[test]
    fn test_object_model_failure_skips_status_update() {
        let mut objects = FakeModel::new(vec![]);
        objects.fail_first = 1;
        let occupancy = FakeModel::new(vec![det("empty", 200.0, 200.0)]);
        let (mut stage, status, _) = stage(occupancy, objects, 1);
        assert_eq!(stage.process(frame(1)), CycleOutcome::InferenceFailed);
        assert_eq!(status.read(), OccupancyStatus::default());
    }

    #[test]
    fn test_encode_failure_skips_publication_only() {
        let occupancy = FakeModel::new(vec![det("empty", 200.0, 1.0)]);
        let (mut stage, status, slot) = stage(occupancy, FakeModel::new(vec![]), 1);
        // JPEG 宽度上限 65535
        stage.settings.width = 70_000;
        stage.settings.height = 2;

        assert_eq!(stage.process(frame(1)), CycleOutcome::EncodeFailed);
        assert!(slot.latest().is_none());
        assert_eq!(status.read(), OccupancyStatus::new(0, 1));
        assert_eq!(stage.stats.encode_failures.load(Ordering::Relaxed), 1);

        stage.settings.width = 640;
        stage.settings.height = 360;
        assert_eq!(
            stage.process(frame(2)),
            CycleOutcome::Published {
                seq: 2,
                status: OccupancyStatus::new(0, 1)
            }
        );
        assert_eq!(slot.latest().map(|f| f.seq), Some(2));
    }

    #[test]
    fn test_frames_resized_to_processing_resolution() {
        let (mut stage, _, slot) = stage(FakeModel::new(vec![]), FakeModel::new(vec![]), 1);
        stage.process(Frame {
            image: RgbImage::new(1280, 720),
            seq: 1,
        });
        let jpeg = slot.latest().unwrap().jpeg;
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
    }
}
