// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 实时流水线 (Real-time pipeline)
//!
//! 两个工作线程, 通过缓冲区连接:
//! - capture:   FrameSource → RawBuffer (满则丢新帧)
//! - inference: RawBuffer → 双模型推理 → 标注 → StatusRegistry + FrameSlot
//!
//! HTTP 服务在自己的线程中只读 StatusRegistry 和 FrameSlot.

pub mod annotate;
pub mod buffer;
pub mod capture;
pub mod encode;
pub mod inference;
pub mod status;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{error, info, info_span};

use crate::config::PipelineConfig;
use crate::input::{CaptureError, FrameSource};
use crate::models::DetectionModel;

pub use annotate::Annotator;
pub use buffer::{AnnotatedFrame, FrameSlot, FrameSubscriber, RawBuffer};
pub use capture::{BreakerEvent, CaptureStage, CircuitBreaker};
pub use inference::{CycleOutcome, InferenceSettings, InferenceStage};
pub use status::{OccupancyStatus, StatusRegistry};

/// 进程级退出标志 (Ctrl-C 或采集源失效时置位)
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 可被退出信号打断的 sleep
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_triggered() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

/// 运行计数器 (各线程原子累加)
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub captured: AtomicU64,
    pub dropped: AtomicU64,
    pub capture_failures: AtomicU64,
    pub skipped: AtomicU64,
    pub published: AtomicU64,
    pub inference_failures: AtomicU64,
    pub encode_failures: AtomicU64,
    last_inference_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub dropped: u64,
    pub capture_failures: u64,
    pub skipped: u64,
    pub published: u64,
    pub inference_failures: u64,
    pub encode_failures: u64,
}

impl PipelineStats {
    pub fn record_inference(&self, elapsed: Duration) {
        self.last_inference_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn last_inference_ms(&self) -> f64 {
        self.last_inference_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
        }
    }
}

/// 运行中的流水线
pub struct Pipeline {
    status: Arc<StatusRegistry>,
    output: FrameSlot,
    stats: Arc<PipelineStats>,
    shutdown: Shutdown,
    capture: Option<JoinHandle<Result<(), CaptureError>>>,
    inference: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// 启动采集线程与推理线程
    pub fn spawn(
        config: &PipelineConfig,
        source: Box<dyn FrameSource>,
        occupancy: Box<dyn DetectionModel>,
        objects: Box<dyn DetectionModel>,
        annotator: Annotator,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let status = Arc::new(StatusRegistry::new());
        let output = FrameSlot::new();
        let stats = Arc::new(PipelineStats::default());
        let buffer = RawBuffer::new(config.raw_capacity);

        let capture = CaptureStage::new(
            source,
            buffer.clone(),
            CircuitBreaker::from_config(config),
            shutdown.clone(),
            stats.clone(),
        );
        let inference = InferenceStage::new(
            occupancy,
            objects,
            annotator,
            InferenceSettings::from_config(config),
            status.clone(),
            output.clone(),
            stats.clone(),
        );

        let source_uri = config.source.clone();
        let capture_shutdown = shutdown.clone();
        let capture = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let span = info_span!("capture", source = %source_uri);
                let result = span.in_scope(|| capture.run());
                if let Err(e) = &result {
                    error!("采集线程终止: {}", e);
                    capture_shutdown.trigger();
                }
                result
            })
            .context("failed to spawn capture thread")?;

        let inference_shutdown = shutdown.clone();
        let inference = thread::Builder::new()
            .name("inference".into())
            .spawn(move || {
                let span = info_span!("inference");
                span.in_scope(|| inference.run(buffer, inference_shutdown));
            })
            .context("failed to spawn inference thread")?;

        Ok(Self {
            status,
            output,
            stats,
            shutdown,
            capture: Some(capture),
            inference: Some(inference),
        })
    }

    pub fn status(&self) -> Arc<StatusRegistry> {
        self.status.clone()
    }

    pub fn output(&self) -> FrameSlot {
        self.output.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// 等待两个线程结束; 采集线程因采集源失效退出时返回错误
    pub fn join(mut self) -> Result<()> {
        let capture = match self.capture.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("capture thread panicked")),
            None => Ok(Ok(())),
        };
        // 采集结束 (包括 panic) 后推理线程也没有输入了
        self.shutdown.trigger();
        let inference = match self.inference.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("inference thread panicked")),
            None => Ok(()),
        };

        info!(stats = ?self.stats.snapshot(), "流水线已停止");
        let capture = capture?;
        inference?;
        capture.map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_interrupts_sleep() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.trigger();
        });
        let t = Instant::now();
        shutdown.sleep(Duration::from_secs(10));
        assert!(t.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_triggered());
        handle.join().unwrap();
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = PipelineStats::default();
        stats.captured.fetch_add(3, Ordering::Relaxed);
        stats.record_inference(Duration::from_millis(12));
        assert_eq!(stats.snapshot().captured, 3);
        assert!((stats.last_inference_ms() - 12.0).abs() < 1e-6);
    }
}
