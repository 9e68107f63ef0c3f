// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/mask.rs - 掩码原型与掩码重建
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

use ndarray::{Array2, Array3, ArrayView3, Zip};

use crate::model::{DetectionBox, Mask, PrototypeLayout, SegmentError};

/// 掩码原型，形状为 `(K, rows, cols)`
#[derive(Debug, Clone)]
pub struct MaskPrototypes {
  protos: Array3<f32>,
}

impl MaskPrototypes {
  /// 从原型张量读取，按布局将通道轴换到最前
  pub fn from_tensor(tensor: &[f32], layout: &PrototypeLayout) -> Result<Self, SegmentError> {
    let size_error = || SegmentError::TensorSize {
      name: "prototypes",
      expected: layout.len(),
      actual: tensor.len(),
    };
    let data = tensor.get(..layout.len()).ok_or_else(size_error)?;

    let protos = if layout.channels_first {
      ArrayView3::from_shape((layout.masks_num, layout.rows, layout.cols), data)
        .map_err(|_| size_error())?
        .to_owned()
    } else {
      ArrayView3::from_shape((layout.rows, layout.cols, layout.masks_num), data)
        .map_err(|_| size_error())?
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned()
    };
    Ok(Self { protos })
  }

  pub fn from_array(protos: Array3<f32>) -> Self {
    Self { protos }
  }

  pub fn masks_num(&self) -> usize {
    self.protos.dim().0
  }

  pub fn rows(&self) -> usize {
    self.protos.dim().1
  }

  pub fn cols(&self) -> usize {
    self.protos.dim().2
  }

  pub fn view(&self) -> ArrayView3<'_, f32> {
    self.protos.view()
  }
}

/// 掩码缩放，必须保持激活值的相对大小顺序
pub trait MaskScaler: Send + Sync {
  fn scale(&self, mask: &Mask, width: u32, height: u32) -> Mask;
}

/// 最近邻缩放，只复制源值
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestScaler;

impl MaskScaler for NearestScaler {
  fn scale(&self, mask: &Mask, width: u32, height: u32) -> Mask {
    if mask.width == width && mask.height == height {
      return mask.clone();
    }
    if mask.width == 0 || mask.height == 0 {
      return Mask::zeros(width, height);
    }

    let nearest = |dst: u32, dst_len: u32, src_len: u32| {
      let src = ((dst as f64 + 0.5) * src_len as f64 / dst_len as f64) as u32;
      src.min(src_len - 1) as usize
    };
    let columns: Vec<usize> = (0..width)
      .map(|x| nearest(x, width, mask.width))
      .collect();

    let mut data = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
      let row = nearest(y, height, mask.height) * mask.stride();
      data.extend(columns.iter().map(|&x| mask.data[row + x]));
    }
    Mask {
      width,
      height,
      data,
    }
  }
}

/// 重建检测框对应的掩码并缩放到 `width × height`
///
/// 各原型通道按权重加权累加，只有网格坐标 `(x + 1, y + 1)` 严格落在检测框
/// 换算到原型网格后的区域内的单元才参与累加，框外单元恒为 0。
pub fn reconstruct_mask(
  prototypes: &MaskPrototypes,
  detection: &DetectionBox,
  width: u32,
  height: u32,
  scaler: &dyn MaskScaler,
) -> Mask {
  let (rows, cols) = (prototypes.rows(), prototypes.cols());
  let rel_x1 = detection.x1 * cols as f32;
  let rel_x2 = detection.x2 * cols as f32;
  let rel_y1 = detection.y1 * rows as f32;
  let rel_y2 = detection.y2 * rows as f32;
  let inside = |x: usize, y: usize| {
    let gx = (x + 1) as f32;
    let gy = (y + 1) as f32;
    gx > rel_x1 && gx < rel_x2 && gy > rel_y1 && gy < rel_y2
  };

  let mut acc = Array2::<f32>::zeros((rows, cols));
  for (proto, &weight) in prototypes
    .view()
    .outer_iter()
    .zip(detection.mask_weights.iter())
  {
    Zip::indexed(&mut acc)
      .and(&proto)
      .for_each(|(y, x), cell, &value| {
        if inside(x, y) {
          *cell += value * weight;
        }
      });
  }

  let grid = Mask {
    width: cols as u32,
    height: rows as u32,
    data: acc.iter().copied().collect(),
  };
  scaler.scale(&grid, width, height)
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn channels_last_tensor_is_permuted() {
    // rows=1, cols=2, K=2 : [(r0c0: k0, k1), (r0c1: k0, k1)]
    let layout = PrototypeLayout {
      rows: 1,
      cols: 2,
      masks_num: 2,
      channels_first: false,
    };
    let protos = MaskPrototypes::from_tensor(&[1.0, 10.0, 2.0, 20.0], &layout).unwrap();
    let view = protos.view();
    assert_eq!(view[[0, 0, 0]], 1.0);
    assert_eq!(view[[0, 0, 1]], 2.0);
    assert_eq!(view[[1, 0, 0]], 10.0);
    assert_eq!(view[[1, 0, 1]], 20.0);
  }

  #[test]
  fn short_prototype_tensor_is_rejected() {
    let layout = PrototypeLayout {
      rows: 2,
      cols: 2,
      masks_num: 2,
      channels_first: true,
    };
    assert!(MaskPrototypes::from_tensor(&[0.0; 3], &layout).is_err());
  }

  #[test]
  fn weighted_channels_accumulate_inside_box() {
    let mut protos = Array3::<f32>::zeros((2, 4, 4));
    protos.index_axis_mut(ndarray::Axis(0), 0).fill(1.0);
    protos.index_axis_mut(ndarray::Axis(0), 1).fill(2.0);
    let protos = MaskPrototypes::from_array(protos);

    // 网格坐标 x+1 ∈ (0, 4) 即 x ∈ {0, 1, 2}
    let detection = DetectionBox::from_corners([0.0, 0.0, 1.0, 1.0], 0.9, 0, "berried")
      .with_mask_weights(vec![0.5, 0.25]);
    let mask = reconstruct_mask(&protos, &detection, 4, 4, &NearestScaler);

    assert_eq!(mask.get(0, 0), Some(1.0));
    assert_eq!(mask.get(2, 2), Some(1.0));
    assert_eq!(mask.get(3, 0), Some(0.0));
    assert_eq!(mask.get(0, 3), Some(0.0));
  }

  #[test]
  fn nearest_scaler_replicates_cells() {
    let mask = Mask::from_vec(2, 1, vec![0.1, 0.9]).unwrap();
    let scaled = NearestScaler.scale(&mask, 4, 2);
    assert_eq!(scaled.as_slice(), &[0.1, 0.1, 0.9, 0.9, 0.1, 0.1, 0.9, 0.9]);
  }

  proptest! {
    #[test]
    fn cells_outside_box_stay_zero(
      values in prop::collection::vec(-100.0f32..100.0, 2 * 8 * 8),
      weights in prop::collection::vec(-5.0f32..5.0, 2),
      x1 in 0.0f32..0.5, y1 in 0.0f32..0.5, w in 0.05f32..0.5, h in 0.05f32..0.5,
    ) {
      let protos = MaskPrototypes::from_array(Array3::from_shape_vec((2, 8, 8), values).unwrap());
      let detection = DetectionBox::from_corners([x1, y1, x1 + w, y1 + h], 0.9, 0, "berried")
        .with_mask_weights(weights);
      let mask = reconstruct_mask(&protos, &detection, 8, 8, &NearestScaler);

      for y in 0..8u32 {
        for x in 0..8u32 {
          let gx = (x + 1) as f32;
          let gy = (y + 1) as f32;
          let inside = gx > detection.x1 * 8.0
            && gx < detection.x2 * 8.0
            && gy > detection.y1 * 8.0
            && gy < detection.y2 * 8.0;
          if !inside {
            prop_assert_eq!(mask.get(x, y), Some(0.0));
          }
        }
      }
    }
  }
}
