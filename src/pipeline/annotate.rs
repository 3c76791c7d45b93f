// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测框与标签绘制 (imageproc + ab_glyph)

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::info;

use crate::detection::Corners;

pub const OCCUPIED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const EMPTY_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const PERSON_COLOR: Rgb<u8> = Rgb([0, 0, 255]);

const BOX_THICKNESS: i32 = 2;
const LABEL_PX: f32 = 16.0;

/// 内置标签字体 (DejaVu Sans)
static DEFAULT_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

pub struct Annotator {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Annotator {
    /// 加载标签字体; 未指定时使用内置字体, 指定的字体读不到或解析失败直接报错
    pub fn new(font: Option<&Path>) -> Result<Self> {
        let font = match font {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read font {}", path.display()))?;
                let font = FontArc::try_from_vec(bytes)
                    .with_context(|| format!("failed to parse font {}", path.display()))?;
                info!("标签字体: {}", path.display());
                font
            }
            None => FontArc::try_from_slice(DEFAULT_FONT).context("bundled font is invalid")?,
        };
        Ok(Self::with_font(Some(font)))
    }

    /// `None` 时只画框 (测试用)
    pub fn with_font(font: Option<FontArc>) -> Self {
        Self {
            font,
            scale: PxScale::from(LABEL_PX),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 画一个带标签的框; 宽或高不为正时不画
    pub fn draw(&self, image: &mut RgbImage, corners: Corners, label: &str, color: Rgb<u8>) {
        for t in 0..BOX_THICKNESS {
            let w = corners.width() - 2 * t;
            let h = corners.height() - 2 * t;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(corners.x_min + t, corners.y_min + t).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }

        if corners.width() <= 0 || corners.height() <= 0 {
            return;
        }
        if let Some(font) = &self.font {
            let y = corners.y_min - self.scale.y as i32 - 2;
            draw_text_mut(image, color, corners.x_min, y, self.scale, font, label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corners(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Corners {
        Corners {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    #[test]
    fn test_draw_box_outline_only() {
        let annotator = Annotator::with_font(None);
        let mut img = RgbImage::new(64, 64);
        annotator.draw(&mut img, corners(10, 10, 40, 30), "occupied", OCCUPIED_COLOR);

        assert_eq!(*img.get_pixel(10, 10), OCCUPIED_COLOR);
        assert_eq!(*img.get_pixel(11, 11), OCCUPIED_COLOR); // 第二层
        assert_eq!(*img.get_pixel(25, 20), Rgb([0, 0, 0])); // 内部不填充
        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_degenerate_and_offscreen_boxes_do_not_panic() {
        let annotator = Annotator::with_font(None);
        let mut img = RgbImage::new(32, 32);
        annotator.draw(&mut img, corners(5, 5, 5, 20), "empty", EMPTY_COLOR);
        annotator.draw(&mut img, corners(20, 20, 10, 10), "empty", EMPTY_COLOR);
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 0])));

        // 标定偏移后常见的负坐标, 只画可见部分
        annotator.draw(&mut img, corners(-50, -50, 10, 10), "person", PERSON_COLOR);
        assert_eq!(*img.get_pixel(9, 0), PERSON_COLOR);
    }

    #[test]
    fn test_missing_font_is_an_error() {
        assert!(Annotator::new(Some(Path::new("/nonexistent/font.ttf"))).is_err());
    }

    #[test]
    fn test_bundled_font_draws_label() {
        let annotator = Annotator::new(None).unwrap();
        assert!(annotator.has_font());

        let mut img = RgbImage::new(160, 96);
        annotator.draw(&mut img, corners(20, 40, 120, 90), "occupied", OCCUPIED_COLOR);

        // 标签位于框上方 y ∈ [22, 40)
        let label_pixels = (20..120)
            .flat_map(|x| (22..40).map(move |y| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) != Rgb([0, 0, 0]))
            .count();
        assert!(label_pixels > 20, "label pixels: {label_pixels}");
    }
}
