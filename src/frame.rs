// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 输入张量
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

use image::{RgbImage, imageops::FilterType};

use crate::model::InputLayout;

const RGB_CHANNELS: usize = 3;
const PIXEL_SCALE: f32 = 255.0;

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorFormat {
  NHWC,
  NCHW,
}

/// 归一化到 [0, 1] 的 float32 输入张量
#[derive(Debug, Clone)]
pub struct InputTensor {
  data: Box<[f32]>,
  width: u32,
  height: u32,
  format: TensorFormat,
}

impl InputTensor {
  /// 最近邻缩放到模型输入尺寸，再按布局排列并除以 255
  pub fn from_image(image: &RgbImage, layout: &InputLayout) -> Self {
    let resized;
    let image = if image.dimensions() == (layout.width, layout.height) {
      image
    } else {
      resized = image::imageops::resize(image, layout.width, layout.height, FilterType::Nearest);
      &resized
    };

    let (width, height) = (layout.width as usize, layout.height as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; plane * RGB_CHANNELS];

    for (x, y, pixel) in image.enumerate_pixels() {
      let idx = y as usize * width + x as usize;
      for c in 0..RGB_CHANNELS {
        let index = match layout.format {
          TensorFormat::NHWC => idx * RGB_CHANNELS + c,
          TensorFormat::NCHW => c * plane + idx,
        };
        data[index] = pixel[c] as f32 / PIXEL_SCALE;
      }
    }

    Self {
      data: data.into_boxed_slice(),
      width: layout.width,
      height: layout.height,
      format: layout.format,
    }
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn format(&self) -> TensorFormat {
    self.format
  }

  /// `[1, H, W, 3]` 或 `[1, 3, H, W]`
  pub fn shape(&self) -> [usize; 4] {
    let (w, h) = (self.width as usize, self.height as usize);
    match self.format {
      TensorFormat::NHWC => [1, h, w, RGB_CHANNELS],
      TensorFormat::NCHW => [1, RGB_CHANNELS, h, w],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn layout(format: TensorFormat) -> InputLayout {
    InputLayout {
      width: 2,
      height: 1,
      format,
    }
  }

  fn image() -> RgbImage {
    RgbImage::from_fn(2, 1, |x, _| {
      if x == 0 {
        Rgb([255, 0, 51])
      } else {
        Rgb([0, 102, 255])
      }
    })
  }

  #[test]
  fn nhwc_interleaves_channels() {
    let tensor = InputTensor::from_image(&image(), &layout(TensorFormat::NHWC));
    assert_eq!(tensor.shape(), [1, 1, 2, 3]);
    assert_eq!(tensor.as_slice(), &[1.0, 0.0, 0.2, 0.0, 0.4, 1.0]);
  }

  #[test]
  fn nchw_stacks_planes() {
    let tensor = InputTensor::from_image(&image(), &layout(TensorFormat::NCHW));
    assert_eq!(tensor.shape(), [1, 3, 1, 2]);
    assert_eq!(tensor.as_slice(), &[1.0, 0.0, 0.0, 0.4, 0.2, 1.0]);
  }

  #[test]
  fn resizes_to_model_input() {
    let big = RgbImage::from_pixel(8, 4, Rgb([255, 255, 255]));
    let tensor = InputTensor::from_image(&big, &layout(TensorFormat::NHWC));
    assert_eq!(tensor.as_slice().len(), 6);
    assert!(tensor.as_slice().iter().all(|&v| v == 1.0));
  }
}
