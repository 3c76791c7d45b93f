// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 图片序列输入 - 单张图片或目录, 按固定帧率循环播放 (离线调试用)

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{info, warn};

use super::{resize_rgb, CaptureError, FrameSource};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

pub struct ImageSequenceSource {
    frames: Vec<RgbImage>,
    cursor: usize,
    interval: Duration,
    last: Option<Instant>,
}

impl ImageSequenceSource {
    /// 预加载所有图片并缩放到采集分辨率; 目录按文件名排序
    pub fn open(uri: &str, size: (u32, u32), interval: Duration) -> Result<Self, CaptureError> {
        let open_err = |reason: String| CaptureError::Open {
            uri: uri.to_string(),
            reason,
        };

        let paths = collect_paths(Path::new(uri)).map_err(|e| open_err(e.to_string()))?;
        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            match image::open(path) {
                Ok(img) => {
                    let img = resize_rgb(img.to_rgb8(), size.0, size.1)
                        .map_err(|e| open_err(e.to_string()))?;
                    frames.push(img);
                }
                Err(e) => warn!("跳过无法解码的图片 {}: {}", path.display(), e),
            }
        }

        if frames.is_empty() {
            return Err(open_err("no decodable images found".to_string()));
        }
        info!("图片序列加载完成: {} 帧 ({})", frames.len(), uri);

        Ok(Self {
            frames,
            cursor: 0,
            interval,
            last: None,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        // 模拟摄像头帧率
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());

        let frame = self.frames[self.cursor % self.frames.len()].clone();
        self.cursor = (self.cursor + 1) % self.frames.len();
        Ok(frame)
    }
}

fn collect_paths(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}
