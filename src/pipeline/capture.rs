// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 采集阶段: FrameSource → RawBuffer
//!
//! 暂时失败立即重试; 连续失败达到阈值后断路器断开, 冷却后再试探.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::{PipelineStats, RawBuffer, Shutdown};
use crate::config::PipelineConfig;
use crate::input::{CaptureError, Frame, FrameSource};

/// 断路器状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// 未达到阈值, 继续立即重试
    Retry { consecutive: u32 },
    /// 断开, 冷却后试探
    Tripped { trips: u32 },
    /// 断开次数超过上限, 放弃
    Dead { trips: u32 },
}

/// 连续失败断路器
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    max_trips: Option<u32>,
    consecutive: u32,
    trips: u32, // 自上次成功以来的断开次数
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, max_trips: Option<u32>) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            max_trips,
            consecutive: 0,
            trips: 0,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.breaker_threshold,
            Duration::from_millis(config.breaker_cooldown_ms),
            config.max_breaker_trips,
        )
    }

    pub fn record_failure(&mut self) -> BreakerEvent {
        self.consecutive += 1;
        if self.consecutive < self.threshold {
            return BreakerEvent::Retry {
                consecutive: self.consecutive,
            };
        }

        self.consecutive = 0;
        self.trips += 1;
        match self.max_trips {
            Some(max) if self.trips > max => BreakerEvent::Dead { trips: self.trips },
            _ => BreakerEvent::Tripped { trips: self.trips },
        }
    }

    /// 记录一次成功; 如果之前断开过则返回断开次数
    pub fn record_success(&mut self) -> Option<u32> {
        self.consecutive = 0;
        let trips = std::mem::take(&mut self.trips);
        (trips > 0).then_some(trips)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

pub struct CaptureStage {
    source: Box<dyn FrameSource>,
    buffer: RawBuffer,
    breaker: CircuitBreaker,
    shutdown: Shutdown,
    stats: Arc<PipelineStats>,
    seq: u64,
}

impl CaptureStage {
    pub fn new(
        source: Box<dyn FrameSource>,
        buffer: RawBuffer,
        breaker: CircuitBreaker,
        shutdown: Shutdown,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            source,
            buffer,
            breaker,
            shutdown,
            stats,
            seq: 0,
        }
    }

    /// 拉取一帧并尝试入队; 只有致命错误才返回 `Err`
    pub fn step(&mut self) -> Result<(), CaptureError> {
        match self.source.next_frame() {
            Ok(image) => {
                if let Some(trips) = self.breaker.record_success() {
                    info!("采集源恢复 (此前断路 {} 次)", trips);
                }
                self.seq += 1;
                let frame = Frame {
                    image,
                    seq: self.seq,
                };
                if self.buffer.offer(frame) {
                    self.stats.captured.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("原始帧缓冲已满, 丢弃帧 #{}", self.seq);
                }
                Ok(())
            }
            Err(CaptureError::Transient(reason)) => {
                self.stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                match self.breaker.record_failure() {
                    BreakerEvent::Retry { consecutive } => {
                        trace!(consecutive, "采集暂时失败: {}", reason);
                    }
                    BreakerEvent::Tripped { trips } => {
                        warn!(
                            trips,
                            "采集源持续失败, 断路 {:?} 后重试: {}",
                            self.breaker.cooldown(),
                            reason
                        );
                        self.shutdown.sleep(self.breaker.cooldown());
                    }
                    BreakerEvent::Dead { trips } => return Err(CaptureError::SourceDead { trips }),
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 运行到退出信号或采集源失效
    pub fn run(mut self) -> Result<(), CaptureError> {
        info!("采集线程启动 (缓冲容量 {})", self.buffer.capacity());
        while !self.shutdown.is_triggered() {
            self.step()?;
        }
        debug!("采集线程退出, 共采集 {} 帧", self.seq);
        Ok(())
    }
}
