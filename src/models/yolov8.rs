// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测模型实现
// 包含: 模型加载、letterbox 预处理、推理、后处理 (置信度过滤 + NMS)

use std::path::PathBuf;

use anyhow::{bail, Result};
use image::{imageops, RgbImage};
use ndarray::{s, Array, Axis, IxDyn};
use tracing::warn;

use super::coco::coco_names;
use super::DetectionModel;
use crate::{non_max_suppression, Bbox, Detection, OrtBackend, OrtConfig, OrtEP};

/// letterbox 填充色 (与 ultralytics 一致)
const PAD_VALUE: f32 = 144.0 / 255.0;
const CXYWH_OFFSET: usize = 4;

/// YOLOv8 模型参数
#[derive(Debug, Clone)]
pub struct YoloConfig {
    pub model: PathBuf,
    pub width: u32,
    pub height: u32,
    pub conf: f32,
    pub iou: f32,
    pub cuda: bool,
    pub intra_threads: Option<usize>,
    /// 覆盖模型元数据中的类别名
    pub names: Option<Vec<String>>,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            width: 640,
            height: 640,
            conf: 0.25,
            iou: 0.45,
            cuda: false,
            intra_threads: None,
            names: None,
        }
    }
}

/// YOLOv8 后处理器 (与推理引擎解耦, 便于单独测试)
#[derive(Debug, Clone)]
pub struct YoloPostprocessor {
    pub conf: f32,
    pub iou: f32,
    pub width: u32,
    pub height: u32,
    pub names: Vec<String>,
}

impl YoloPostprocessor {
    fn scale_wh(&self, w0: f32, h0: f32) -> (f32, f32, f32) {
        let r = (self.width as f32 / w0).min(self.height as f32 / h0);
        (r, (w0 * r).round(), (h0 * r).round())
    }

    /// 预处理: RGB 帧 → NCHW 张量 (等比缩放, 左上对齐, 其余填充)
    pub fn preprocess(&self, frame: &RgbImage) -> Array<f32, IxDyn> {
        let mut ys =
            Array::from_elem((1, 3, self.height as usize, self.width as usize), PAD_VALUE)
                .into_dyn();

        let (w0, h0) = frame.dimensions();
        let (_, w_new, h_new) = self.scale_wh(w0 as f32, h0 as f32);
        let resized = imageops::resize(
            frame,
            (w_new as u32).max(1),
            (h_new as u32).max(1),
            imageops::FilterType::Triangle,
        );

        for (x, y, rgb) in resized.enumerate_pixels() {
            let x = x as usize;
            let y = y as usize;
            let [r, g, b] = rgb.0;
            ys[[0, 0, y, x]] = (r as f32) / 255.0;
            ys[[0, 1, y, x]] = (g as f32) / 255.0;
            ys[[0, 2, y, x]] = (b as f32) / 255.0;
        }
        ys
    }

    /// 后处理: `[1, 4 + nc, anchors]` → 原始帧坐标系下的检测结果
    pub fn postprocess(&self, preds: &Array<f32, IxDyn>, w0: u32, h0: u32) -> Result<Vec<Detection>> {
        if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
            bail!("unexpected YOLO output shape {:?}", preds.shape());
        }
        let (ratio, _, _) = self.scale_wh(w0 as f32, h0 as f32);
        let (w0, h0) = (w0 as f32, h0 as f32);

        let mut data = Vec::new();
        let anchor = preds.index_axis(Axis(0), 0);
        for pred in anchor.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..]);

            let Some((id, &confidence)) = clss
                .iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };

            if confidence < self.conf {
                continue;
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let bbox = Bbox::from_xyxy(
                (cx - w / 2.).clamp(0., w0),
                (cy - h / 2.).clamp(0., h0),
                (cx + w / 2.).clamp(0., w0),
                (cy + h / 2.).clamp(0., h0),
            );

            let label = self
                .names
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("class{id}"));
            data.push(Detection::new(id, label, confidence, bbox));
        }

        non_max_suppression(&mut data, self.iou);
        Ok(data)
    }
}

/// YOLOv8 完整模型: OrtBackend + 后处理器
pub struct YoloModel {
    engine: OrtBackend,
    post: YoloPostprocessor,
}

impl YoloModel {
    /// 从配置创建模型; 类别名优先级: 配置 > 模型元数据 > COCO
    pub fn new(config: YoloConfig) -> Result<Self> {
        let engine = OrtBackend::build(OrtConfig {
            f: config.model.clone(),
            ep: if config.cuda { OrtEP::CUDA(0) } else { OrtEP::CPU },
            image_size: (config.height, config.width),
            intra_threads: config.intra_threads,
        })?;

        let names = match (config.names, engine.names()) {
            (Some(names), _) => names,
            (None, Some(names)) => names.to_vec(),
            (None, None) => {
                warn!(
                    "{}: 元数据中没有类别名, 使用 COCO 标签",
                    config.model.display()
                );
                coco_names()
            }
        };

        let post = YoloPostprocessor {
            conf: config.conf,
            iou: config.iou,
            width: engine.width(),
            height: engine.height(),
            names,
        };
        Ok(Self { engine, post })
    }
}

impl DetectionModel for YoloModel {
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let xs = self.post.preprocess(frame);
        let ys = self.engine.run(xs)?;
        let Some(preds) = ys.first() else {
            bail!("model produced no outputs");
        };
        self.post.postprocess(preds, frame.width(), frame.height())
    }

    fn names(&self) -> &[String] {
        &self.post.names
    }
}
