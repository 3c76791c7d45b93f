// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测模型统一接口与实现
//!
//! # 架构说明
//!
//! 流水线只依赖 [`DetectionModel`] trait, 两个模型 (车位占用 / 通用目标) 独立调用:
//! ```text
//! 处理分辨率 RGB 帧 → infer → Vec<Detection>(标签 + 置信度 + 检测框)
//! ```
//!
//! ## 完整模型实现
//! - **YoloModel**: YOLOv8 系列 ONNX 模型 (letterbox 预处理 + NMS 后处理)
//!   - 文件: `yolov8.rs`

use anyhow::Result;
use image::RgbImage;

use crate::Detection;

/// 检测能力: 给定一帧, 返回检测结果
///
/// 推理为同步 CPU 密集计算, 调用方在专用线程中执行
pub trait DetectionModel: Send {
    /// 推理一帧, 检测框坐标位于输入帧的像素坐标系
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;

    /// 类别 ID → 标签
    fn names(&self) -> &[String];

    fn label(&self, class_id: usize) -> Option<&str> {
        self.names().get(class_id).map(String::as_str)
    }
}

impl<M: DetectionModel + ?Sized> DetectionModel for Box<M> {
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        (**self).infer(frame)
    }

    fn names(&self) -> &[String] {
        (**self).names()
    }
}

pub mod coco;
pub mod yolov8;

pub use yolov8::{YoloConfig, YoloModel};
