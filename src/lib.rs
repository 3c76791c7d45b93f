// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 运行参数 (CLI + JSON)
pub mod detection; // 检测结果类型与NMS
pub mod input; // 视频输入系统
pub mod models; // 模型接口与具体实现
pub mod ort_backend; // ONNX Runtime 推理后端
pub mod pipeline; // 采集 → 推理 → 发布 流水线
pub mod server; // HTTP 接口 (MJPEG + 车位状态)
pub mod telemetry; // tracing 日志初始化

pub use crate::config::{Args, PipelineConfig};
pub use crate::detection::{non_max_suppression, Bbox, Detection};
pub use crate::input::{CaptureError, Frame, FrameSource};
pub use crate::models::{DetectionModel, YoloModel};
pub use crate::ort_backend::{OrtBackend, OrtConfig, OrtEP};
pub use crate::pipeline::{
    AnnotatedFrame, FrameSlot, OccupancyStatus, Pipeline, Shutdown, StatusRegistry,
};
