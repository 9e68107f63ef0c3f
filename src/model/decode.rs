// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/decode.rs - 检测张量解码
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

use tracing::debug;

use crate::model::layout::BOX_CHANNELS;
use crate::model::{DetectionBox, DetectionLayout, LabelTable, SegmentError};

/// 将通道优先的检测张量解码为候选框
///
/// 每个元素取分数最高的类别，分数严格大于 `threshold` 时才生成候选框。
/// 解码后坐标超出 [0, 1] 的候选框直接丢弃，不做截断。
pub fn decode_detections(
  tensor: &[f32],
  layout: &DetectionLayout,
  threshold: f32,
  labels: &LabelTable,
) -> Result<Vec<DetectionBox>, SegmentError> {
  if tensor.len() < layout.len() {
    return Err(SegmentError::TensorSize {
      name: "detections",
      expected: layout.len(),
      actual: tensor.len(),
    });
  }

  let n = layout.num_elements;
  let at = |channel: usize, element: usize| tensor[channel * n + element];
  let class_end = layout.num_channel - layout.masks_num;

  let mut candidates = Vec::new();
  let mut dropped = 0usize;
  for element in 0..n {
    let mut best: Option<(usize, f32)> = None;
    for channel in BOX_CHANNELS..class_end {
      let score = at(channel, element);
      if score.is_nan() {
        continue;
      }
      if best.is_none_or(|(_, s)| score > s) {
        best = Some((channel - BOX_CHANNELS, score));
      }
    }

    let Some((class_index, score)) = best else {
      continue;
    };
    if score.is_nan() || score <= threshold {
      continue;
    }

    let center = [
      at(0, element),
      at(1, element),
      at(2, element),
      at(3, element),
    ];
    let candidate = DetectionBox::from_center(center, score, class_index, labels.name(class_index));
    if !candidate.is_normalized() {
      dropped += 1;
      continue;
    }

    let mask_weights = (class_end..layout.num_channel)
      .map(|channel| at(channel, element))
      .collect();
    candidates.push(candidate.with_mask_weights(mask_weights));
  }

  debug!(
    "解码得到 {} 个候选框, 越界丢弃 {} 个",
    candidates.len(),
    dropped
  );
  Ok(candidates)
}
