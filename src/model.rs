// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测结果与模型接口
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

use std::hash::{Hash, Hasher};
use std::ops::{Add, AddAssign};
use std::path::Path;
use std::time::Duration;

use image::RgbImage;
use thiserror::Error;

use crate::frame::InputTensor;

mod decode;
mod layout;
mod mask;
mod nms;
#[cfg(feature = "rknpu")]
mod rknn;
mod segmenter;

pub use self::decode::decode_detections;
pub use self::layout::{DetectionLayout, InputLayout, PrototypeLayout, TensorLayout};
pub use self::mask::{MaskPrototypes, MaskScaler, NearestScaler, reconstruct_mask};
pub use self::nms::{iou, non_max_suppression, select_central};
#[cfg(feature = "rknpu")]
pub use self::rknn::{RknnEngine, RknnEngineBuilder, RknnEngineError};
pub use self::segmenter::{Detector, Segmenter};

/// 内置标签表，模型未附带标签时使用
pub const DEFAULT_LABELS: [&str; 2] = ["berried", "non-berried"];

/// 检测框
///
/// 所有坐标均为相对于当前所在图像空间的归一化坐标。检测框生成后不再修改，
/// 坐标映射总是产生新的值。
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
  /// 置信度
  pub confidence: f32,
  /// 类别索引
  pub class_index: usize,
  /// 类别名称
  pub class_name: String,
  /// 掩码权重，长度与原型通道数一致
  pub mask_weights: Vec<f32>,
}

impl DetectionBox {
  /// 由中心点与宽高 `[cx, cy, w, h]` 构造
  pub fn from_center(
    center: [f32; 4],
    confidence: f32,
    class_index: usize,
    class_name: impl Into<String>,
  ) -> Self {
    let [cx, cy, w, h] = center;
    Self {
      x1: cx - w / 2.0,
      y1: cy - h / 2.0,
      x2: cx + w / 2.0,
      y2: cy + h / 2.0,
      cx,
      cy,
      w,
      h,
      confidence,
      class_index,
      class_name: class_name.into(),
      mask_weights: Vec::new(),
    }
  }

  /// 由角点 `[x1, y1, x2, y2]` 构造
  pub fn from_corners(
    corners: [f32; 4],
    confidence: f32,
    class_index: usize,
    class_name: impl Into<String>,
  ) -> Self {
    let [x1, y1, x2, y2] = corners;
    Self {
      x1,
      y1,
      x2,
      y2,
      cx: (x1 + x2) / 2.0,
      cy: (y1 + y2) / 2.0,
      w: x2 - x1,
      h: y2 - y1,
      confidence,
      class_index,
      class_name: class_name.into(),
      mask_weights: Vec::new(),
    }
  }

  pub fn with_mask_weights(mut self, mask_weights: Vec<f32>) -> Self {
    self.mask_weights = mask_weights;
    self
  }

  pub fn with_class(mut self, class_index: usize, class_name: impl Into<String>) -> Self {
    self.class_index = class_index;
    self.class_name = class_name.into();
    self
  }

  pub fn corners(&self) -> [f32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }

  /// 坐标是否全部落在 [0, 1] 内
  pub fn is_normalized(&self) -> bool {
    self.x1 >= 0.0 && self.y1 >= 0.0 && self.x2 <= 1.0 && self.y2 <= 1.0
  }

  pub fn area(&self) -> f32 {
    self.w * self.h
  }
}

/// 稠密掩码，行优先存储，步长等于宽度
#[derive(Debug, Clone)]
pub struct Mask {
  width: u32,
  height: u32,
  data: Vec<f32>,
}

impl Mask {
  pub fn zeros(width: u32, height: u32) -> Self {
    Self {
      width,
      height,
      data: vec![0.0; width as usize * height as usize],
    }
  }

  /// 数据长度与宽高不符时返回 `None`
  pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Option<Self> {
    (data.len() == width as usize * height as usize).then_some(Self {
      width,
      height,
      data,
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn stride(&self) -> usize {
    self.width as usize
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_vec(self) -> Vec<f32> {
    self.data
  }

  pub fn get(&self, x: u32, y: u32) -> Option<f32> {
    if x >= self.width || y >= self.height {
      return None;
    }
    self.data.get(y as usize * self.stride() + x as usize).copied()
  }

  pub fn set(&mut self, x: u32, y: u32, value: f32) {
    if x < self.width && y < self.height {
      let stride = self.stride();
      self.data[y as usize * stride + x as usize] = value;
    }
  }

  pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
    self.data.chunks_exact(self.stride().max(1))
  }

  /// 严格大于阈值的单元数量
  pub fn count_above(&self, threshold: f32) -> usize {
    self.data.iter().filter(|&&v| v > threshold).count()
  }
}

// 按内容逐位比较，保证 Eq 与 Hash 一致
impl PartialEq for Mask {
  fn eq(&self, other: &Self) -> bool {
    self.width == other.width
      && self.height == other.height
      && self
        .data
        .iter()
        .zip(other.data.iter())
        .all(|(a, b)| a.to_bits() == b.to_bits())
  }
}

impl Eq for Mask {}

impl Hash for Mask {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.width.hash(state);
    self.height.hash(state);
    for value in &self.data {
      value.to_bits().hash(state);
    }
  }
}

/// 分割结果：一个检测框与一张掩码
///
/// 相等性与哈希只取决于掩码内容，检测框不参与比较。
#[derive(Debug, Clone)]
pub struct SegmentationResult {
  pub detection: DetectionBox,
  pub mask: Mask,
}

impl PartialEq for SegmentationResult {
  fn eq(&self, other: &Self) -> bool {
    self.mask == other.mask
  }
}

impl Eq for SegmentationResult {}

impl Hash for SegmentationResult {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.mask.hash(state);
  }
}

/// 流水线耗时，跨阶段累加
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineTiming {
  pub preprocess: Duration,
  pub inference: Duration,
  pub postprocess: Duration,
}

impl PipelineTiming {
  pub fn total(&self) -> Duration {
    self.preprocess + self.inference + self.postprocess
  }
}

impl Add for PipelineTiming {
  type Output = PipelineTiming;

  fn add(self, rhs: Self) -> Self::Output {
    PipelineTiming {
      preprocess: self.preprocess + rhs.preprocess,
      inference: self.inference + rhs.inference,
      postprocess: self.postprocess + rhs.postprocess,
    }
  }
}

impl AddAssign for PipelineTiming {
  fn add_assign(&mut self, rhs: Self) {
    *self = *self + rhs;
  }
}

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件格式错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 标签表，与分类分数通道按索引对齐
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  names: Vec<String>,
}

impl Default for LabelTable {
  fn default() -> Self {
    Self::from_names(DEFAULT_LABELS)
  }
}

impl LabelTable {
  pub fn from_names<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  /// 从 JSON 字符串数组读取标签表，空数组回退到内置标签表
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let data = std::fs::read(path)?;
    let names: Vec<String> = serde_json::from_slice(&data)?;
    if names.is_empty() {
      return Ok(Self::default());
    }
    Ok(Self { names })
  }

  /// 索引超出标签表时合成 `class<idx>`
  pub fn name(&self, index: usize) -> String {
    self
      .names
      .get(index)
      .cloned()
      .unwrap_or_else(|| format!("class{}", index))
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

#[derive(Error, Debug)]
pub enum SegmentError {
  #[error("推理引擎错误: {0}")]
  Engine(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("张量 {name} 大小不匹配: 期望 {expected}, 实际 {actual}")]
  TensorSize {
    name: &'static str,
    expected: usize,
    actual: usize,
  },
}

impl SegmentError {
  pub fn engine<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
    SegmentError::Engine(Box::new(err))
  }
}

/// 推理引擎各张量的形状
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineShapes {
  /// `[1, H, W, 3]` 或 `[1, 3, H, W]`
  pub input: Vec<usize>,
  /// `[1, numChannel, numElements]`
  pub detections: Vec<usize>,
  /// `[1, rows, cols, K]` 或 `[1, K, rows, cols]`
  pub prototypes: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
  pub detections: Vec<f32>,
  pub prototypes: Vec<f32>,
}

pub trait InferenceEngine {
  type Error: std::error::Error + Send + Sync + 'static;

  fn shapes(&self) -> EngineShapes;
  fn infer(&self, input: &InputTensor) -> Result<EngineOutput, Self::Error>;
}

#[derive(Debug, Clone, Default)]
pub struct Detections {
  pub boxes: Vec<DetectionBox>,
  pub timing: PipelineTiming,
}

/// 第一阶段检测器
pub trait PrimaryDetector {
  /// 返回 `Ok(None)` 表示张量形状未解析，检测没有执行
  fn detect(&self, image: &RgbImage) -> Result<Option<Detections>, SegmentError>;
}

/// 单区域分割的结果，至多一个检测
#[derive(Debug, Clone)]
pub enum Segmentation {
  Unavailable,
  Empty {
    timing: PipelineTiming,
  },
  Found {
    result: SegmentationResult,
    timing: PipelineTiming,
  },
}

impl Segmentation {
  pub fn timing(&self) -> PipelineTiming {
    match self {
      Segmentation::Unavailable => PipelineTiming::default(),
      Segmentation::Empty { timing } | Segmentation::Found { timing, .. } => *timing,
    }
  }
}

/// 第二阶段分割器
pub trait RegionSegmenter {
  fn segment(&self, image: &RgbImage) -> Result<Segmentation, SegmentError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn result(corners: [f32; 4], data: Vec<f32>) -> SegmentationResult {
    SegmentationResult {
      detection: DetectionBox::from_corners(corners, 0.9, 0, "berried"),
      mask: Mask::from_vec(2, 2, data).unwrap(),
    }
  }

  #[test]
  fn results_with_same_mask_are_equal_regardless_of_box() {
    let a = result([0.1, 0.1, 0.4, 0.4], vec![0.0, 0.5, 1.0, 0.0]);
    let b = result([0.6, 0.6, 0.9, 0.9], vec![0.0, 0.5, 1.0, 0.0]);
    assert_eq!(a, b);

    let mut set = HashSet::new();
    set.insert(a);
    assert!(!set.insert(b));
  }

  #[test]
  fn results_with_same_box_but_different_mask_differ() {
    let a = result([0.1, 0.1, 0.4, 0.4], vec![0.0, 0.5, 1.0, 0.0]);
    let b = result([0.1, 0.1, 0.4, 0.4], vec![0.0, 0.5, 1.0, 0.1]);
    assert_ne!(a, b);
  }

  #[test]
  fn label_table_synthesizes_missing_names() {
    let labels = LabelTable::from_names(["berried"]);
    assert_eq!(labels.name(0), "berried");
    assert_eq!(labels.name(3), "class3");
  }

  #[test]
  fn timing_accumulates_per_stage() {
    let mut total = PipelineTiming {
      preprocess: Duration::from_millis(1),
      inference: Duration::from_millis(10),
      postprocess: Duration::from_millis(2),
    };
    total += PipelineTiming {
      preprocess: Duration::from_millis(3),
      inference: Duration::from_millis(20),
      postprocess: Duration::from_millis(4),
    };
    assert_eq!(total.preprocess, Duration::from_millis(4));
    assert_eq!(total.inference, Duration::from_millis(30));
    assert_eq!(total.postprocess, Duration::from_millis(6));
    assert_eq!(total.total(), Duration::from_millis(40));
  }

  #[test]
  fn center_and_corner_constructors_agree() {
    let a = DetectionBox::from_center([0.5, 0.5, 0.2, 0.4], 0.8, 1, "non-berried");
    let b = DetectionBox::from_corners([0.4, 0.3, 0.6, 0.7], 0.8, 1, "non-berried");
    for (x, y) in a.corners().iter().zip(b.corners().iter()) {
      assert!((x - y).abs() < 1e-6);
    }
    assert!((a.area() - b.area()).abs() < 1e-6);
  }
}
