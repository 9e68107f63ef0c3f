// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 流水线配置
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

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_SECONDARY_CONFIDENCE_THRESHOLD: f32 = 0.3;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MASK_ACTIVATION_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MASK_ALPHA: u8 = 150;
pub const DEFAULT_PALETTE_MODULUS: usize = 10;
pub const DEFAULT_PLACEHOLDER_SIZE: (u32, u32) = (640, 640);

// 蓝、红、绿
pub const DEFAULT_PALETTE: [[u8; 3]; 3] = [[0, 0, 255], [255, 0, 0], [0, 255, 0]];

const BOX_STROKE: u32 = 2;
const LABEL_PADDING: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
  /// 单阶段检测置信度阈值
  pub confidence_threshold: f32,
  /// 级联时对第一阶段检测结果的过滤阈值
  pub secondary_confidence_threshold: f32,
  /// NMS IoU 阈值
  pub iou_threshold: f32,
  /// 掩码激活阈值
  pub mask_activation_threshold: f32,
  /// 掩码绘制的固定透明度
  pub mask_alpha: u8,
  pub palette: Vec<[u8; 3]>,
  /// 调色板索引取 `class_index % palette_modulus`
  pub palette_modulus: usize,
  /// 无检测结果时占位画布的尺寸
  pub placeholder_size: (u32, u32),
  pub box_stroke: u32,
  pub label_padding: i32,
  pub label_font_size: f32,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      secondary_confidence_threshold: DEFAULT_SECONDARY_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      mask_activation_threshold: DEFAULT_MASK_ACTIVATION_THRESHOLD,
      mask_alpha: DEFAULT_MASK_ALPHA,
      palette: DEFAULT_PALETTE.to_vec(),
      palette_modulus: DEFAULT_PALETTE_MODULUS,
      placeholder_size: DEFAULT_PLACEHOLDER_SIZE,
      box_stroke: BOX_STROKE,
      label_padding: LABEL_PADDING,
      label_font_size: LABEL_FONT_SIZE,
    }
  }
}

impl PipelineConfig {
  pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn with_secondary_confidence_threshold(mut self, threshold: f32) -> Self {
    self.secondary_confidence_threshold = threshold;
    self
  }

  pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn with_mask_activation_threshold(mut self, threshold: f32) -> Self {
    self.mask_activation_threshold = threshold;
    self
  }

  pub fn with_mask_alpha(mut self, alpha: u8) -> Self {
    self.mask_alpha = alpha;
    self
  }

  pub fn with_palette(mut self, palette: Vec<[u8; 3]>, modulus: usize) -> Self {
    self.palette = palette;
    self.palette_modulus = modulus;
    self
  }
}
