// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/layout.rs - 张量形状解析
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

use tracing::{debug, warn};

use crate::frame::TensorFormat;
use crate::model::EngineShapes;

const RGB_CHANNELS: usize = 3;
/// 前 4 个通道为 cx, cy, w, h
pub(crate) const BOX_CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLayout {
  pub width: u32,
  pub height: u32,
  pub format: TensorFormat,
}

/// 检测张量 `[1, num_channel, num_elements]`，通道优先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionLayout {
  pub num_channel: usize,
  pub num_elements: usize,
  pub masks_num: usize,
}

impl DetectionLayout {
  pub fn num_classes(&self) -> usize {
    self.num_channel - BOX_CHANNELS - self.masks_num
  }

  pub fn len(&self) -> usize {
    self.num_channel * self.num_elements
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 原型张量，`channels_first` 为 `[1, K, rows, cols]`，否则为 `[1, rows, cols, K]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrototypeLayout {
  pub rows: usize,
  pub cols: usize,
  pub masks_num: usize,
  pub channels_first: bool,
}

impl PrototypeLayout {
  pub fn len(&self) -> usize {
    self.rows * self.cols * self.masks_num
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLayout {
  pub input: InputLayout,
  pub detections: DetectionLayout,
  pub prototypes: PrototypeLayout,
}

impl TensorLayout {
  /// 根据引擎报告的形状确定各轴含义；任一参数缺失或为 0 时返回 `None`
  pub fn resolve(shapes: &EngineShapes) -> Option<Self> {
    let input = resolve_input(&shapes.input)?;
    let prototypes = resolve_prototypes(&shapes.prototypes)?;

    let (num_channel, num_elements) = match shapes.detections.as_slice() {
      [_, c, e] if *c > 0 && *e > 0 => (*c, *e),
      other => {
        warn!("检测张量形状无效: {:?}", other);
        return None;
      }
    };

    if num_channel <= BOX_CHANNELS + prototypes.masks_num {
      warn!(
        "检测张量通道数 {} 不足以容纳 {} 个框通道与 {} 个掩码通道",
        num_channel, BOX_CHANNELS, prototypes.masks_num
      );
      return None;
    }

    let layout = TensorLayout {
      input,
      detections: DetectionLayout {
        num_channel,
        num_elements,
        masks_num: prototypes.masks_num,
      },
      prototypes,
    };
    debug!("张量布局: {:?}", layout);
    Some(layout)
  }
}

fn resolve_input(shape: &[usize]) -> Option<InputLayout> {
  let (height, width, format) = match shape {
    [_, c, h, w] if *c == RGB_CHANNELS => (*h, *w, TensorFormat::NCHW),
    [_, h, w, _] => (*h, *w, TensorFormat::NHWC),
    other => {
      warn!("输入张量形状无效: {:?}", other);
      return None;
    }
  };
  if width == 0 || height == 0 {
    warn!("输入张量尺寸为 0: {:?}", shape);
    return None;
  }
  Some(InputLayout {
    width: width as u32,
    height: height as u32,
    format,
  })
}

fn resolve_prototypes(shape: &[usize]) -> Option<PrototypeLayout> {
  let [_, a, b, c] = shape else {
    warn!("原型张量形状无效: {:?}", shape);
    return None;
  };
  let (a, b, c) = (*a, *b, *c);
  if a == 0 || b == 0 || c == 0 {
    warn!("原型张量尺寸为 0: {:?}", shape);
    return None;
  }

  // 通道数总小于空间尺寸
  let layout = if a < c {
    PrototypeLayout {
      rows: b,
      cols: c,
      masks_num: a,
      channels_first: true,
    }
  } else {
    PrototypeLayout {
      rows: a,
      cols: b,
      masks_num: c,
      channels_first: false,
    }
  };
  Some(layout)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn shapes(input: &[usize], detections: &[usize], prototypes: &[usize]) -> EngineShapes {
    EngineShapes {
      input: input.to_vec(),
      detections: detections.to_vec(),
      prototypes: prototypes.to_vec(),
    }
  }

  #[test]
  fn resolves_channels_last_model() {
    let layout =
      TensorLayout::resolve(&shapes(&[1, 640, 640, 3], &[1, 37, 8400], &[1, 160, 160, 32]))
        .unwrap();
    assert_eq!(layout.input.format, TensorFormat::NHWC);
    assert_eq!((layout.input.width, layout.input.height), (640, 640));
    assert_eq!(layout.detections.num_classes(), 1);
    assert_eq!(layout.prototypes.masks_num, 32);
    assert!(!layout.prototypes.channels_first);
  }

  #[test]
  fn resolves_channels_first_model() {
    let layout =
      TensorLayout::resolve(&shapes(&[1, 3, 480, 640], &[1, 38, 6300], &[1, 32, 120, 160]))
        .unwrap();
    assert_eq!(layout.input.format, TensorFormat::NCHW);
    assert_eq!((layout.input.width, layout.input.height), (640, 480));
    assert_eq!(layout.prototypes.rows, 120);
    assert_eq!(layout.prototypes.cols, 160);
    assert!(layout.prototypes.channels_first);
  }

  #[test]
  fn missing_or_zero_shapes_are_unavailable() {
    assert!(TensorLayout::resolve(&EngineShapes::default()).is_none());
    assert!(
      TensorLayout::resolve(&shapes(&[1, 640, 640, 3], &[1, 0, 8400], &[1, 160, 160, 32]))
        .is_none()
    );
    assert!(
      TensorLayout::resolve(&shapes(&[1, 640, 640, 3], &[1, 37, 8400], &[1, 160, 0, 32]))
        .is_none()
    );
  }
}
