// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 分割结果叠加层绘制
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, Rgba, RgbImage, RgbaImage, imageops::FilterType};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::model::{DetectionBox, Mask, SegmentationResult};

// 未加载字体时的文本尺寸估计
const LABEL_CHAR_WIDTH: f32 = 9.0;
const LABEL_TEXT_HEIGHT: u32 = 12;
const LABEL_TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]); // 白色文本
const OPAQUE: u8 = 255;

#[derive(Error, Debug)]
pub enum ComposeError {
  #[error("调色板过小: 索引 {index}, 调色板长度 {len}")]
  PaletteTooSmall { index: usize, len: usize },
  #[error("调色板取模不能为 0")]
  ZeroModulus,
  #[error("字体无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 将最终检测结果绘制到透明画布上
pub struct Compositor {
  palette: Vec<[u8; 3]>,
  palette_modulus: usize,
  mask_alpha: u8,
  placeholder_size: (u32, u32),
  box_stroke: u32,
  label_padding: i32,
  font_scale: PxScale,
  font: Option<FontArc>,
}

impl Default for Compositor {
  fn default() -> Self {
    Self::new(&PipelineConfig::default())
  }
}

impl Compositor {
  pub fn new(config: &PipelineConfig) -> Self {
    Self {
      palette: config.palette.clone(),
      palette_modulus: config.palette_modulus,
      mask_alpha: config.mask_alpha,
      placeholder_size: config.placeholder_size,
      box_stroke: config.box_stroke,
      label_padding: config.label_padding,
      font_scale: PxScale::from(config.label_font_size),
      font: None,
    }
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, ComposeError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)?;
    Ok(self.with_font(font))
  }

  /// 未加载字体时标签只绘制背景
  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 颜色索引为 `class_index % palette_modulus`，越界时报错而不是访问越界
  pub fn color_for(&self, class_index: usize) -> Result<[u8; 3], ComposeError> {
    if self.palette_modulus == 0 {
      return Err(ComposeError::ZeroModulus);
    }
    let index = class_index % self.palette_modulus;
    self
      .palette
      .get(index)
      .copied()
      .ok_or(ComposeError::PaletteTooSmall {
        index,
        len: self.palette.len(),
      })
  }

  /// 画布尺寸取第一个结果的掩码尺寸；没有结果时返回固定尺寸的透明占位画布
  pub fn compose(&self, results: &[SegmentationResult]) -> Result<RgbaImage, ComposeError> {
    let Some(first) = results.first() else {
      let (w, h) = self.placeholder_size;
      return Ok(RgbaImage::new(w, h));
    };

    let mut canvas = RgbaImage::new(first.mask.width(), first.mask.height());
    for result in results {
      let color = self.color_for(result.detection.class_index)?;
      self.paint_mask(&mut canvas, &result.mask, color);
      self.draw_box_with_label(&mut canvas, &result.detection, color);
    }
    debug!("绘制 {} 个分割结果", results.len());
    Ok(canvas)
  }

  /// 掩码值大于 0 的像素直接设为固定透明度的调色板颜色
  pub fn paint_mask(&self, canvas: &mut RgbaImage, mask: &Mask, color: [u8; 3]) {
    let [r, g, b] = color;
    let (w, h) = canvas.dimensions();
    for (y, row) in mask.rows().enumerate().take(h as usize) {
      for (x, &value) in row.iter().enumerate().take(w as usize) {
        if value > 0.0 {
          canvas.put_pixel(x as u32, y as u32, Rgba([r, g, b, self.mask_alpha]));
        }
      }
    }
  }

  fn measure(&self, text: &str) -> (u32, u32) {
    match &self.font {
      Some(font) => text_size(self.font_scale, font, text),
      None => (
        (text.chars().count() as f32 * LABEL_CHAR_WIDTH) as u32,
        LABEL_TEXT_HEIGHT,
      ),
    }
  }

  fn draw_box_with_label(&self, canvas: &mut RgbaImage, detection: &DetectionBox, color: [u8; 3]) {
    let (w, h) = (canvas.width() as f32, canvas.height() as f32);
    let [r, g, b] = color;
    let paint = Rgba([r, g, b, OPAQUE]);

    let left = (detection.x1 * w) as i32;
    let top = (detection.y1 * h) as i32;
    let right = (detection.x2 * w) as i32;
    let bottom = (detection.y2 * h) as i32;

    // 边框向内加粗
    for t in 0..self.box_stroke as i32 {
      let (rw, rh) = (right - left - 2 * t, bottom - top - 2 * t);
      if rw <= 0 || rh <= 0 {
        break;
      }
      let rect = Rect::at(left + t, top + t).of_size(rw as u32, rh as u32);
      draw_hollow_rect_mut(canvas, rect, paint);
    }

    // 标签背景紧贴检测框左上角上方
    let label = detection.class_name.as_str();
    let (text_width, text_height) = self.measure(label);
    let padding = self.label_padding;
    let background_width = text_width as i32 + 2 * padding;
    let background_height = text_height as i32 + 2 * padding;
    if background_width > 0 && background_height > 0 {
      let rect = Rect::at(left, top - background_height)
        .of_size(background_width as u32, background_height as u32);
      draw_filled_rect_mut(canvas, rect, paint);
    }

    if let Some(font) = &self.font {
      draw_text_mut(
        canvas,
        LABEL_TEXT_COLOR,
        left + padding,
        top - padding - text_height as i32,
        self.font_scale,
        font,
        label,
      );
    }
  }
}

/// 将叠加层按透明度混合到原始帧上
pub fn overlay_on_frame(frame: &RgbImage, canvas: &RgbaImage) -> RgbImage {
  let mut base = DynamicImage::ImageRgb8(frame.clone()).to_rgba8();
  if canvas.dimensions() == frame.dimensions() {
    image::imageops::overlay(&mut base, canvas, 0, 0);
  } else {
    let scaled = image::imageops::resize(canvas, frame.width(), frame.height(), FilterType::Nearest);
    image::imageops::overlay(&mut base, &scaled, 0, 0);
  }
  DynamicImage::ImageRgba8(base).to_rgb8()
}
