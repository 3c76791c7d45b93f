// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! FFmpeg 采集 (RTSP 流 / 本地摄像头)
//!
//! 解码线程里由 `scale + format=rgb24` 滤镜直接输出采集分辨率的 RGB 帧,
//! 经容量为 1 的通道交给 `next_frame`. 解码结束后下一次调用会重新拉流.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Frame, Input};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::{CaptureError, FrameSource};
use crate::config::SourceKind;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const START_TIMEOUT: Duration = Duration::from_secs(15);

/// 解码滤镜: rgb24 AVFrame → RgbImage
#[derive(Clone)]
struct RgbFilter {
    tx: Sender<RgbImage>,
    width: u32,
    height: u32,
    dropped: u64,
}

impl FrameFilter for RgbFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!("解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            self.dropped += 1;
            return Ok(None);
        }

        let image = unsafe {
            let av = &*frame.as_ptr();
            let (w, h) = (av.width as u32, av.height as u32);
            let stride = av.linesize[0] as usize;
            let row = w as usize * 3;
            if w != self.width || h != self.height || av.data[0].is_null() || stride < row {
                self.dropped += 1;
                return Ok(None);
            }

            let mut buf = Vec::with_capacity(row * h as usize);
            for y in 0..h as usize {
                let line = std::slice::from_raw_parts(av.data[0].add(y * stride), row);
                buf.extend_from_slice(line);
            }
            RgbImage::from_raw(w, h, buf)
        };

        let Some(image) = image else {
            self.dropped += 1;
            return Ok(None);
        };
        match self.tx.try_send(image) {
            Ok(()) => Ok(None),
            // 消费方还没取走上一帧, 直接丢弃
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                Ok(None)
            }
            Err(TrySendError::Disconnected(_)) => Err("frame receiver closed".to_string()),
        }
    }
}

pub struct FfmpegSource {
    uri: String,
    kind: SourceKind,
    size: (u32, u32),
    rx: Option<Receiver<RgbImage>>,
}

impl FfmpegSource {
    pub fn open(uri: &str, kind: SourceKind, size: (u32, u32)) -> Result<Self, CaptureError> {
        let rx = start_decoder(uri, kind, size).map_err(|reason| CaptureError::Open {
            uri: uri.to_string(),
            reason,
        })?;
        info!("FFmpeg 采集启动: {}", uri);
        Ok(Self {
            uri: uri.to_string(),
            kind,
            size,
            rx: Some(rx),
        })
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if self.rx.is_none() {
            let rx = start_decoder(&self.uri, self.kind, self.size).map_err(CaptureError::Transient)?;
            info!("FFmpeg 重新拉流成功: {}", self.uri);
            self.rx = Some(rx);
        }
        let Some(rx) = self.rx.as_ref() else {
            return Err(CaptureError::transient("decoder not running"));
        };

        match rx.recv_timeout(FRAME_TIMEOUT) {
            Ok(image) => Ok(image),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::transient("no frame within timeout")),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("FFmpeg 解码结束: {}", self.uri);
                self.rx = None;
                Err(CaptureError::transient("decoder stopped"))
            }
        }
    }
}

/// 设备序号 → 平台输入 (格式, 地址)
fn device_input(uri: &str) -> (&'static str, String) {
    #[cfg(target_os = "windows")]
    {
        ("dshow", format!("video={}", uri))
    }
    #[cfg(target_os = "macos")]
    {
        ("avfoundation", uri.to_string())
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if uri.starts_with("/dev/") {
            ("v4l2", uri.to_string())
        } else {
            ("v4l2", format!("/dev/video{}", uri))
        }
    }
}

/// 在独立线程中建立 FFmpeg 上下文; 建立或启动失败时返回错误
fn start_decoder(uri: &str, kind: SourceKind, size: (u32, u32)) -> Result<Receiver<RgbImage>, String> {
    let (tx, rx) = bounded(1);
    let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
    let filter = RgbFilter {
        tx,
        width: size.0,
        height: size.1,
        dropped: 0,
    };
    let uri = uri.to_string();

    thread::Builder::new()
        .name("ffmpeg-decode".into())
        .spawn(move || {
            let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
            let pipe = pipe.filter("rgb", Box::new(filter));
            let out = create_null_output().add_frame_pipeline(pipe);

            let input = match kind {
                SourceKind::Device => {
                    let (format, url) = device_input(&uri);
                    Input::new(url).set_format(format)
                }
                _ => Input::new(uri.as_str()).set_input_opts([("rtsp_transport", "tcp")].into()),
            };

            let ctx = FfmpegContext::builder()
                .input(input)
                .filter_desc(format!("scale={}:{},format=rgb24", size.0, size.1))
                .output(out)
                .build();
            let ctx = match ctx {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("构建失败: {}", e)));
                    return;
                }
            };
            let sch = match ctx.start() {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("启动失败: {}", e)));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            let _ = sch.wait();
        })
        .map_err(|e| e.to_string())?;

    match ready_rx.recv_timeout(START_TIMEOUT) {
        Ok(Ok(())) => Ok(rx),
        Ok(Err(e)) => Err(e),
        Err(_) => Err("decoder did not start in time".to_string()),
    }
}
