// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运行参数 - 命令行 + 可选 JSON 配置文件
//!
//! 优先级: 命令行 > JSON 文件 > 默认值. 启动后不再修改.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

/// 采集源类型 (根据 URI 推断)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// HTTP MJPEG 网络摄像头
    Mjpeg,
    /// RTSP 流 (需要 `ffmpeg` feature)
    Rtsp,
    /// 本地摄像头设备, 例如 `0` 或 `/dev/video0` (需要 `ffmpeg` feature)
    Device,
    /// 单张图片或图片目录 (循环播放)
    Images,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            SourceKind::Mjpeg
        } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("/dev/video") || uri.parse::<usize>().is_ok() {
            SourceKind::Device
        } else {
            SourceKind::Images
        }
    }
}

/// 流水线参数
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    // === 采集 ===
    pub source: String,        // 采集源 URI
    pub capture_width: u32,    // 采集分辨率
    pub capture_height: u32,
    pub raw_capacity: usize,   // 原始帧缓冲容量
    pub source_fps: u32,       // 图片序列源的播放帧率

    // === 推理 ===
    pub processing_width: u32, // 处理分辨率
    pub processing_height: u32,
    pub frame_skip: u64,       // 每 N 帧推理一次
    pub occupancy_model: PathBuf,
    pub object_model: PathBuf,
    pub occupancy_labels: Option<Vec<String>>, // 覆盖模型元数据中的类别名
    pub object_labels: Option<Vec<String>>,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub cuda: bool,
    pub intra_threads: Option<usize>,

    // === 标注 ===
    pub shift_x: i32, // 标定偏移 (从检测框坐标中减去)
    pub shift_y: i32,
    pub font: Option<PathBuf>,
    pub jpeg_quality: u8,

    // === 断路器 ===
    pub breaker_threshold: u32, // 连续失败多少次后断开
    pub breaker_cooldown_ms: u64,
    pub max_breaker_trips: Option<u32>, // None = 永不放弃

    // === HTTP ===
    pub host: String,
    pub port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: String::from("http://127.0.0.1:8080/video"),
            capture_width: 640,
            capture_height: 360,
            raw_capacity: 10,
            source_fps: 30,

            processing_width: 640,
            processing_height: 360,
            frame_skip: 3,
            occupancy_model: PathBuf::from("models/parking.onnx"),
            object_model: PathBuf::from("models/yolov8m.onnx"),
            occupancy_labels: None,
            object_labels: None,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            cuda: false,
            intra_threads: None,

            shift_x: 100,
            shift_y: 100,
            font: None,
            jpeg_quality: 80,

            breaker_threshold: 1000,
            breaker_cooldown_ms: 1000,
            max_breaker_trips: None,

            host: String::from("0.0.0.0"),
            port: 5000,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        info!("配置已从 {} 加载", path.display());
        Ok(config)
    }

    pub fn source_kind(&self) -> SourceKind {
        SourceKind::from_uri(&self.source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_skip == 0 {
            bail!("frame_skip must be at least 1");
        }
        if self.raw_capacity == 0 {
            bail!("raw_capacity must be at least 1");
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            bail!("capture resolution must be non-zero");
        }
        if self.processing_width == 0 || self.processing_height == 0 {
            bail!("processing resolution must be non-zero");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg_quality must be between 1 and 100");
        }
        if self.breaker_threshold == 0 {
            bail!("breaker_threshold must be at least 1");
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            source = %self.source,
            capture = %format_args!("{}x{}", self.capture_width, self.capture_height),
            processing = %format_args!("{}x{}", self.processing_width, self.processing_height),
            frame_skip = self.frame_skip,
            raw_capacity = self.raw_capacity,
            shift = %format_args!("({}, {})", self.shift_x, self.shift_y),
            "pipeline configuration"
        );
        info!("车位模型: {}", self.occupancy_model.display());
        info!("目标模型: {}", self.object_model.display());
    }
}

/// 停车位实时监控参数
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "停车位占用实时检测 + MJPEG 推流", long_about = None)]
pub struct Args {
    /// JSON 配置文件 (命令行参数优先)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 采集源: http(s) MJPEG 地址 / rtsp 地址 / 摄像头序号 / 图片或目录
    #[arg(short, long)]
    pub source: Option<String>,

    /// 车位占用模型 (ONNX)
    #[arg(long)]
    pub occupancy_model: Option<PathBuf>,

    /// 目标检测模型 (ONNX, COCO)
    #[arg(long)]
    pub object_model: Option<PathBuf>,

    /// 每 N 帧推理一次
    #[arg(long)]
    pub frame_skip: Option<u64>,

    /// 采集宽度
    #[arg(long)]
    pub width: Option<u32>,

    /// 采集高度
    #[arg(long)]
    pub height: Option<u32>,

    /// 原始帧缓冲容量
    #[arg(long)]
    pub raw_capacity: Option<usize>,

    /// 标定偏移 X
    #[arg(long, allow_hyphen_values = true)]
    pub shift_x: Option<i32>,

    /// 标定偏移 Y
    #[arg(long, allow_hyphen_values = true)]
    pub shift_y: Option<i32>,

    /// 标签字体 (TTF/OTF)
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// JPEG 质量 (1-100)
    #[arg(long)]
    pub jpeg_quality: Option<u8>,

    /// 使用 CUDA 执行提供者
    #[arg(long)]
    pub cuda: bool,

    /// 监听地址
    #[arg(long)]
    pub host: Option<String>,

    /// 监听端口
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl Args {
    /// 合并配置文件与命令行参数
    pub fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(v) = self.source {
            config.source = v;
        }
        if let Some(v) = self.occupancy_model {
            config.occupancy_model = v;
        }
        if let Some(v) = self.object_model {
            config.object_model = v;
        }
        if let Some(v) = self.frame_skip {
            config.frame_skip = v;
        }
        if let Some(v) = self.width {
            config.capture_width = v;
        }
        if let Some(v) = self.height {
            config.capture_height = v;
        }
        if let Some(v) = self.raw_capacity {
            config.raw_capacity = v;
        }
        if let Some(v) = self.shift_x {
            config.shift_x = v;
        }
        if let Some(v) = self.shift_y {
            config.shift_y = v;
        }
        if self.font.is_some() {
            config.font = self.font;
        }
        if let Some(v) = self.jpeg_quality {
            config.jpeg_quality = v;
        }
        if self.cuda {
            config.cuda = true;
        }
        if let Some(v) = self.host {
            config.host = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }

        config.validate()?;
        Ok(config)
    }
}
