// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! ONNX Runtime 推理后端
//!
//! 负责: 会话创建、执行提供者选择、类别名元数据解析、原始张量推理

use std::fmt::Display;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use ndarray::{Array, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use regex::Regex;
use tracing::{debug, info};

/// 执行提供者
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
}

/// 后端配置
#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: PathBuf,
    pub ep: OrtEP,
    pub image_size: (u32, u32), // (height, width)
    pub intra_threads: Option<usize>,
}

pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    height: u32,
    width: u32,
    names: Option<Vec<String>>,
}

fn ort_err<E: Display>(what: &'static str) -> impl FnOnce(E) -> anyhow::Error {
    move |e| anyhow!("{what}: {e}")
}

impl OrtBackend {
    pub fn build(config: OrtConfig) -> Result<Self> {
        let mut builder = Session::builder()
            .map_err(ort_err("failed to create ORT session builder"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err("failed to set optimization level"))?;

        if let Some(n) = config.intra_threads {
            builder = builder
                .with_intra_threads(n)
                .map_err(ort_err("failed to set intra-op threads"))?;
        }

        let ep = match config.ep {
            #[cfg(feature = "cuda")]
            OrtEP::CUDA(device_id) => {
                use ort::execution_providers::CUDAExecutionProvider;
                builder = builder
                    .with_execution_providers([CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build()])
                    .map_err(ort_err("failed to register CUDA execution provider"))?;
                config.ep
            }
            #[cfg(not(feature = "cuda"))]
            OrtEP::CUDA(_) => {
                tracing::warn!("CUDA requested but built without the `cuda` feature; using CPU");
                OrtEP::CPU
            }
            OrtEP::CPU => OrtEP::CPU,
        };

        let session = builder
            .commit_from_file(&config.f)
            .map_err(ort_err("failed to load ONNX model"))?;

        let names = session
            .metadata()
            .ok()
            .and_then(|m| m.custom("names").ok().flatten())
            .map(|raw| parse_names(&raw))
            .filter(|names| !names.is_empty());

        let (height, width) = config.image_size;
        info!(
            "模型加载成功: {} ({:?}, {}x{}, {} classes)",
            config.f.display(),
            ep,
            width,
            height,
            names.as_ref().map_or(0, Vec::len)
        );

        Ok(Self {
            session,
            ep,
            height,
            width,
            names,
        })
    }

    /// 执行推理, 返回所有输出张量
    pub fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let input = Tensor::from_array(xs).map_err(ort_err("failed to create input tensor"))?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(ort_err("ONNX inference failed"))?;

        let mut ys = Vec::new();
        for (name, value) in outputs.iter() {
            let y = value
                .try_extract_array::<f32>()
                .map_err(ort_err("failed to extract output tensor"))?;
            debug!("output {name}: {:?}", y.shape());
            ys.push(y.into_owned());
        }
        Ok(ys)
    }

    pub fn ep(&self) -> OrtEP {
        self.ep
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// 元数据中的类别名 (ultralytics 导出时写入)
    pub fn names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }
}

/// 解析 ultralytics 元数据中的类别名
///
/// 格式: `{0: 'person', 1: 'bicycle', ..., 27: "yellow_lady's_slipper"}`
pub fn parse_names(raw: &str) -> Vec<String> {
    let re = match Regex::new(r#"\d+\s*:\s*(?:'([^']*)'|"([^"]*)")"#) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.captures_iter(raw)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}
