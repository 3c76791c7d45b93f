// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 视频输入系统 (Video Input System)
//!
//! 采集源抽象: 按需产出原始帧, 可能暂时失败
//! - MjpegSource:         HTTP MJPEG 网络摄像头
//! - ImageSequenceSource: 单张图片 / 图片目录循环播放
//! - FfmpegSource:        RTSP 流 / 本地摄像头 (`ffmpeg` feature)

pub mod images;
pub mod mjpeg;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::time::Duration;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::RgbImage;
use thiserror::Error;

use crate::config::{PipelineConfig, SourceKind};

pub use images::ImageSequenceSource;
pub use mjpeg::MjpegSource;

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegSource;

/// 原始帧 (采集线程 → 推理线程)
///
/// 所有权整体移交, 不在阶段之间共享缓冲区
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub seq: u64, // 到达序号
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// 启动时无法打开采集源 (致命)
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    /// 暂时没有可用帧, 调用方直接重试
    #[error("no frame available: {0}")]
    Transient(String),
    /// 断路器多次断开仍无恢复
    #[error("video source declared dead after {trips} breaker trips")]
    SourceDead { trips: u32 },
}

impl CaptureError {
    pub fn transient(reason: impl ToString) -> Self {
        CaptureError::Transient(reason.to_string())
    }
}

/// 帧生产者
pub trait FrameSource: Send {
    /// 拉取一帧; `Transient` 表示可以立即重试
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        (**self).next_frame()
    }
}

/// 根据配置打开采集源, 打不开则返回 `CaptureError::Open`
pub fn open_source(config: &PipelineConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    let size = (config.capture_width, config.capture_height);
    match config.source_kind() {
        SourceKind::Mjpeg => Ok(Box::new(MjpegSource::open(&config.source, size)?)),
        SourceKind::Images => {
            let interval = Duration::from_secs_f64(1.0 / config.source_fps.max(1) as f64);
            Ok(Box::new(ImageSequenceSource::open(
                &config.source,
                size,
                interval,
            )?))
        }
        #[cfg(feature = "ffmpeg")]
        kind @ (SourceKind::Rtsp | SourceKind::Device) => Ok(Box::new(FfmpegSource::open(
            &config.source,
            kind,
            size,
        )?)),
        #[cfg(not(feature = "ffmpeg"))]
        SourceKind::Rtsp | SourceKind::Device => Err(CaptureError::Open {
            uri: config.source.clone(),
            reason: "RTSP/camera capture requires the `ffmpeg` feature".to_string(),
        }),
    }
}

/// RGB 缩放 (fast_image_resize, 双线性). 尺寸一致时直接返回
pub fn resize_rgb(image: RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    if image.dimensions() == (width, height) {
        return Ok(image);
    }

    let (w0, h0) = image.dimensions();
    let src = fr::images::Image::from_vec_u8(w0, h0, image.into_raw(), fr::PixelType::U8x3)
        .context("failed to wrap frame for resize")?;
    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .context("frame resize failed")?;

    RgbImage::from_raw(width, height, dst.into_vec()).context("resized buffer size mismatch")
}
