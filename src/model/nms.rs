// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/nms.rs - 非极大值抑制与中心框选择
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

use crate::model::DetectionBox;

const IMAGE_CENTER: (f32, f32) = (0.5, 0.5);

/// 计算两个检测框的 IoU，并集面积取各自声明的 w·h
pub fn iou(a: &DetectionBox, b: &DetectionBox) -> f32 {
  let x1 = a.x1.max(b.x1);
  let y1 = a.y1.max(b.y1);
  let x2 = a.x2.min(b.x2);
  let y2 = a.y2.min(b.y2);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let union = a.area() + b.area() - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

/// 非极大值抑制
///
/// 按置信度降序依次接受检测框，并移除与之 IoU ≥ `iou_threshold` 的其余检测框，
/// 不区分类别。
pub fn non_max_suppression(
  mut candidates: Vec<DetectionBox>,
  iou_threshold: f32,
) -> Vec<DetectionBox> {
  // 按置信度降序排序
  candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let total = candidates.len();
  let mut kept = Vec::new();
  let mut remaining = candidates.into_iter();
  while let Some(best) = remaining.next() {
    let rest: Vec<_> = remaining
      .filter(|other| iou(&best, other) < iou_threshold)
      .collect();
    kept.push(best);
    remaining = rest.into_iter();
  }

  debug!("NMS: {} -> {}", total, kept.len());
  kept
}

/// 选出中心离图像中心 (0.5, 0.5) 最近的检测框，距离相同时取先出现者
pub fn select_central(boxes: &[DetectionBox]) -> Option<&DetectionBox> {
  let distance = |b: &DetectionBox| {
    let dx = b.cx - IMAGE_CENTER.0;
    let dy = b.cy - IMAGE_CENTER.1;
    dx * dx + dy * dy
  };
  boxes
    .iter()
    .min_by(|a, b| distance(a).total_cmp(&distance(b)))
}
