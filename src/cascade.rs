// 该文件是 Shanan （山南西风） 项目的一部分。
// src/cascade.rs - 检测-分割级联
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

use std::time::Instant;

use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::model::{
  DetectionBox, Mask, MaskScaler, NearestScaler, PipelineTiming, PrimaryDetector,
  RegionSegmenter, Segmentation, SegmentationResult,
};
use crate::pipeline::{Pipeline, PipelineOutcome};

mod barrier;
pub use self::barrier::CompletionBarrier;

#[cfg(feature = "rayon")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "rayon")]
impl<T: Sync> MaybeSync for T {}

#[cfg(not(feature = "rayon"))]
pub trait MaybeSync {}
#[cfg(not(feature = "rayon"))]
impl<T> MaybeSync for T {}

/// 源图像上的像素裁剪区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
  pub left: u32,
  pub top: u32,
  pub width: u32,
  pub height: u32,
}

impl CropRect {
  /// 将归一化检测框换算为像素区域，宽高各至少 1 像素；无法得到正面积时返回 `None`
  pub fn from_box(detection: &DetectionBox, image_width: u32, image_height: u32) -> Option<Self> {
    if image_width == 0 || image_height == 0 {
      return None;
    }
    if !detection.corners().iter().all(|v| v.is_finite()) {
      return None;
    }

    let (w, h) = (image_width as i64, image_height as i64);
    let left = ((detection.x1 * image_width as f32) as i64).clamp(0, w - 1);
    let top = ((detection.y1 * image_height as f32) as i64).clamp(0, h - 1);
    let right = ((detection.x2 * image_width as f32) as i64).clamp(left + 1, w);
    let bottom = ((detection.y2 * image_height as f32) as i64).clamp(top + 1, h);

    let (width, height) = (right - left, bottom - top);
    (width > 0 && height > 0).then_some(CropRect {
      left: left as u32,
      top: top as u32,
      width: width as u32,
      height: height as u32,
    })
  }
}

/// 将裁剪区域内的归一化检测框映射回整幅图像的归一化坐标
///
/// `full = (offset + local * size) / full_size`，x 与 y 轴独立计算。
pub fn remap_box(
  local: &DetectionBox,
  crop: &CropRect,
  full_width: u32,
  full_height: u32,
) -> DetectionBox {
  let sx = crop.width as f32 / full_width as f32;
  let sy = crop.height as f32 / full_height as f32;
  let x = |v: f32| (crop.left as f32 + v * crop.width as f32) / full_width as f32;
  let y = |v: f32| (crop.top as f32 + v * crop.height as f32) / full_height as f32;

  DetectionBox {
    x1: x(local.x1),
    y1: y(local.y1),
    x2: x(local.x2),
    y2: y(local.y2),
    cx: x(local.cx),
    cy: y(local.cy),
    w: local.w * sx,
    h: local.h * sy,
    ..local.clone()
  }
}

/// 将裁剪区域内的掩码放回整幅画布，只复制严格大于阈值的单元
pub fn remap_mask(
  local: &Mask,
  crop: &CropRect,
  full_width: u32,
  full_height: u32,
  threshold: f32,
  scaler: &dyn MaskScaler,
) -> Mask {
  let scaled = scaler.scale(local, crop.width, crop.height);
  let mut full = Mask::zeros(full_width, full_height);
  for (y, row) in scaled.rows().enumerate() {
    for (x, &value) in row.iter().enumerate() {
      if value > threshold {
        full.set(crop.left + x as u32, crop.top + y as u32, value);
      }
    }
  }
  full
}

/// 选出缩放到裁剪尺寸后激活面积最大的候选，面积相同时取先出现者
pub fn best_candidate<'a>(
  candidates: &'a [SegmentationResult],
  crop: &CropRect,
  threshold: f32,
  scaler: &dyn MaskScaler,
) -> Option<&'a SegmentationResult> {
  let mut best: Option<(&SegmentationResult, usize)> = None;
  for candidate in candidates {
    let area = scaler
      .scale(&candidate.mask, crop.width, crop.height)
      .count_above(threshold);
    if best.is_none_or(|(_, a)| area > a) {
      best = Some((candidate, area));
    }
  }
  best.map(|(candidate, _)| candidate)
}

#[cfg(feature = "rayon")]
fn for_each_crop<F>(detections: &[DetectionBox], task: F)
where
  F: Fn(&DetectionBox) + Sync + Send,
{
  use rayon::prelude::*;
  detections.par_iter().for_each(task);
}

#[cfg(not(feature = "rayon"))]
fn for_each_crop<F>(detections: &[DetectionBox], task: F)
where
  F: Fn(&DetectionBox),
{
  detections.iter().for_each(task);
}

/// 两阶段级联：第一阶段检测，逐框裁剪后第二阶段分割，再映射回整幅图像
pub struct Cascade<P, S, M = NearestScaler> {
  primary: P,
  secondary: S,
  scaler: M,
  secondary_confidence_threshold: f32,
  mask_activation_threshold: f32,
}

impl<P, S> Cascade<P, S> {
  pub fn new(primary: P, secondary: S, config: &PipelineConfig) -> Self {
    Self {
      primary,
      secondary,
      scaler: NearestScaler,
      secondary_confidence_threshold: config.secondary_confidence_threshold,
      mask_activation_threshold: config.mask_activation_threshold,
    }
  }
}

impl<P, S, M> Cascade<P, S, M> {
  pub fn with_scaler<T: MaskScaler>(self, scaler: T) -> Cascade<P, S, T> {
    Cascade {
      primary: self.primary,
      secondary: self.secondary,
      scaler,
      secondary_confidence_threshold: self.secondary_confidence_threshold,
      mask_activation_threshold: self.mask_activation_threshold,
    }
  }

  pub fn primary(&self) -> &P {
    &self.primary
  }

  pub fn secondary(&self) -> &S {
    &self.secondary
  }
}

impl<P, S, M> Cascade<P, S, M>
where
  S: RegionSegmenter,
  M: MaskScaler,
{
  /// 处理单个第一阶段检测；任何分支都返回，由调用方恰好计数一次
  fn segment_crop(
    &self,
    frame: &RgbImage,
    detection: &DetectionBox,
  ) -> (Option<SegmentationResult>, PipelineTiming) {
    let (full_width, full_height) = frame.dimensions();
    let Some(crop) = CropRect::from_box(detection, full_width, full_height) else {
      warn!("裁剪区域无效, 跳过检测框 {:?}", detection.corners());
      return (None, PipelineTiming::default());
    };

    let cropped =
      image::imageops::crop_imm(frame, crop.left, crop.top, crop.width, crop.height).to_image();
    let segmentation = match self.secondary.segment(&cropped) {
      Ok(segmentation) => segmentation,
      Err(e) => {
        warn!("第二阶段分割失败, 忽略该检测: {}", e);
        return (None, PipelineTiming::default());
      }
    };

    let mut timing = segmentation.timing();
    let Segmentation::Found { result, .. } = segmentation else {
      debug!("裁剪区域 {:?} 没有分割结果", crop);
      return (None, timing);
    };

    let start = Instant::now();
    let threshold = self.mask_activation_threshold;
    let remapped = best_candidate(std::slice::from_ref(&result), &crop, threshold, &self.scaler)
      .map(|best| SegmentationResult {
        detection: remap_box(&best.detection, &crop, full_width, full_height)
          .with_class(detection.class_index, detection.class_name.clone()),
        mask: remap_mask(
          &best.mask,
          &crop,
          full_width,
          full_height,
          threshold,
          &self.scaler,
        ),
      });
    timing.postprocess += start.elapsed();

    (remapped, timing)
  }
}

impl<P, S, M> Pipeline for Cascade<P, S, M>
where
  P: PrimaryDetector + MaybeSync,
  S: RegionSegmenter + MaybeSync,
  M: MaskScaler,
{
  fn process<F>(&self, frame: &RgbImage, sink: F)
  where
    F: FnOnce(PipelineOutcome) + Send,
  {
    let detections = match self.primary.detect(frame) {
      Ok(Some(detections)) => detections,
      Ok(None) => {
        warn!("第一阶段张量形状未解析");
        sink(PipelineOutcome::Unavailable);
        return;
      }
      Err(e) => {
        error!("第一阶段检测失败: {}", e);
        sink(PipelineOutcome::Error(e.to_string()));
        return;
      }
    };

    let retained: Vec<DetectionBox> = detections
      .boxes
      .into_iter()
      .filter(|b| b.confidence > self.secondary_confidence_threshold)
      .collect();
    info!("第一阶段保留 {} 个检测框", retained.len());

    if retained.is_empty() {
      sink(PipelineOutcome::Empty);
      return;
    }

    let barrier = CompletionBarrier::new(retained.len(), detections.timing, |results, timing| {
      sink(PipelineOutcome::Results { results, timing })
    });

    for_each_crop(&retained, |detection| {
      let (result, timing) = self.segment_crop(frame, detection);
      barrier.arrive(result, timing);
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Detections, SegmentError};
  use std::sync::Mutex;
  use std::time::Duration;

  fn full_mask_result(width: u32, height: u32, value: f32) -> SegmentationResult {
    SegmentationResult {
      detection: DetectionBox::from_corners([0.0, 0.0, 1.0, 1.0], 0.9, 7, "secondary"),
      mask: Mask::from_vec(width, height, vec![value; (width * height) as usize]).unwrap(),
    }
  }

  struct FixedPrimary(Result<Option<Vec<DetectionBox>>, ()>);

  impl PrimaryDetector for FixedPrimary {
    fn detect(&self, _image: &RgbImage) -> Result<Option<Detections>, SegmentError> {
      match &self.0 {
        Ok(boxes) => Ok(boxes.clone().map(|boxes| Detections {
          boxes,
          timing: PipelineTiming {
            inference: Duration::from_millis(10),
            ..Default::default()
          },
        })),
        Err(()) => Err(SegmentError::TensorSize {
          name: "detections",
          expected: 1,
          actual: 0,
        }),
      }
    }
  }

  /// 整个裁剪区域激活为 0.8；宽度为 1 的裁剪区域视为引擎故障
  struct WholeCrop;

  impl RegionSegmenter for WholeCrop {
    fn segment(&self, image: &RgbImage) -> Result<Segmentation, SegmentError> {
      if image.width() == 1 {
        return Err(SegmentError::TensorSize {
          name: "prototypes",
          expected: 1,
          actual: 0,
        });
      }
      Ok(Segmentation::Found {
        result: full_mask_result(image.width(), image.height(), 0.8),
        timing: PipelineTiming {
          inference: Duration::from_millis(5),
          ..Default::default()
        },
      })
    }
  }

  fn run<P: PrimaryDetector + MaybeSync, S: RegionSegmenter + MaybeSync>(
    cascade: &Cascade<P, S>,
    frame: &RgbImage,
  ) -> Vec<PipelineOutcome> {
    let outcomes = Mutex::new(Vec::new());
    cascade.process(frame, |outcome| outcomes.lock().unwrap().push(outcome));
    outcomes.into_inner().unwrap()
  }

  #[test]
  fn crop_rect_scales_and_clamps() {
    let b = DetectionBox::from_corners([0.25, 0.5, 0.75, 1.0], 0.9, 0, "a");
    assert_eq!(
      CropRect::from_box(&b, 100, 40),
      Some(CropRect {
        left: 25,
        top: 20,
        width: 50,
        height: 20
      })
    );

    let degenerate = DetectionBox::from_corners([0.5, 0.5, 0.5, 0.5], 0.9, 0, "a");
    let crop = CropRect::from_box(&degenerate, 100, 40).unwrap();
    assert_eq!((crop.width, crop.height), (1, 1));

    assert!(CropRect::from_box(&b, 0, 40).is_none());
    let nan = DetectionBox::from_corners([f32::NAN, 0.0, 1.0, 1.0], 0.9, 0, "a");
    assert!(CropRect::from_box(&nan, 100, 40).is_none());
  }

  #[test]
  fn remapping_unit_box_yields_crop_rectangle() {
    let crop = CropRect {
      left: 30,
      top: 12,
      width: 50,
      height: 20,
    };
    let (w, h) = (200u32, 80u32);
    let local = DetectionBox::from_corners([0.0, 0.0, 1.0, 1.0], 0.9, 0, "a");
    let full = remap_box(&local, &crop, w, h);

    assert_eq!(full.x1, 30.0 / 200.0);
    assert_eq!(full.y1, 12.0 / 80.0);
    assert_eq!(full.x2, (30.0 + 50.0) / 200.0);
    assert_eq!(full.y2, (12.0 + 20.0) / 80.0);
  }

  #[test]
  fn remapped_mask_copies_only_activated_cells() {
    let crop = CropRect {
      left: 1,
      top: 2,
      width: 2,
      height: 1,
    };
    let local = Mask::from_vec(2, 1, vec![0.3, 0.31]).unwrap();
    let full = remap_mask(&local, &crop, 4, 4, 0.3, &NearestScaler);

    assert_eq!(full.get(1, 2), Some(0.0));
    assert_eq!(full.get(2, 2), Some(0.31));
    assert_eq!(full.count_above(0.0), 1);
  }

  #[test]
  fn largest_activated_area_wins_over_confidence() {
    let crop = CropRect {
      left: 0,
      top: 0,
      width: 2,
      height: 2,
    };
    let mut small = full_mask_result(2, 2, 0.0);
    small.mask.set(0, 0, 0.9);
    small.detection.confidence = 0.99;
    let mut large = full_mask_result(2, 2, 0.0);
    large.mask.set(0, 0, 0.5);
    large.mask.set(1, 1, 0.5);
    large.detection.confidence = 0.4;

    let candidates = [small, large];
    let best = best_candidate(&candidates, &crop, 0.3, &NearestScaler).unwrap();
    assert_eq!(best.detection.confidence, 0.4);
  }

  #[test]
  fn results_inherit_primary_class_and_sum_timing() {
    let primary = FixedPrimary(Ok(Some(vec![
      DetectionBox::from_corners([0.0, 0.0, 0.5, 0.5], 0.9, 1, "non-berried"),
      DetectionBox::from_corners([0.5, 0.5, 1.0, 1.0], 0.2, 0, "berried"),
    ])));
    let cascade = Cascade::new(primary, WholeCrop, &PipelineConfig::default());
    let outcomes = run(&cascade, &RgbImage::new(8, 8));

    assert_eq!(outcomes.len(), 1);
    let PipelineOutcome::Results { results, timing } = &outcomes[0] else {
      panic!("expected results, got {:?}", outcomes[0]);
    };
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.detection.class_index, 1);
    assert_eq!(result.detection.class_name, "non-berried");
    assert_eq!(result.detection.corners(), [0.0, 0.0, 0.5, 0.5]);
    assert_eq!((result.mask.width(), result.mask.height()), (8, 8));
    assert_eq!(result.mask.count_above(0.0), 16);
    assert_eq!(timing.inference, Duration::from_millis(15));
  }

  #[test]
  fn invalid_crops_complete_with_empty_results() {
    for n in [1usize, 5] {
      let boxes = vec![DetectionBox::from_corners([f32::NAN, 0.0, 0.5, 0.5], 0.9, 0, "a"); n];
      let cascade = Cascade::new(
        FixedPrimary(Ok(Some(boxes))),
        WholeCrop,
        &PipelineConfig::default(),
      );
      let outcomes = run(&cascade, &RgbImage::new(8, 8));

      assert_eq!(outcomes.len(), 1, "n = {}", n);
      assert!(matches!(&outcomes[0], PipelineOutcome::Results { results, .. } if results.is_empty()));
    }
  }

  #[test]
  fn no_retained_detection_is_empty() {
    let boxes = vec![DetectionBox::from_corners([0.0, 0.0, 0.5, 0.5], 0.3, 0, "a")];
    let cascade = Cascade::new(
      FixedPrimary(Ok(Some(boxes))),
      WholeCrop,
      &PipelineConfig::default(),
    );
    let outcomes = run(&cascade, &RgbImage::new(8, 8));
    assert!(matches!(outcomes.as_slice(), [PipelineOutcome::Empty]));

    let cascade = Cascade::new(
      FixedPrimary(Ok(Some(Vec::new()))),
      WholeCrop,
      &PipelineConfig::default(),
    );
    let outcomes = run(&cascade, &RgbImage::new(8, 8));
    assert!(matches!(outcomes.as_slice(), [PipelineOutcome::Empty]));
  }

  #[test]
  fn secondary_failure_only_drops_that_detection() {
    let primary = FixedPrimary(Ok(Some(vec![
      // 1 像素宽的裁剪区域触发故障
      DetectionBox::from_corners([0.0, 0.0, 0.1, 0.5], 0.9, 0, "berried"),
      DetectionBox::from_corners([0.5, 0.5, 1.0, 1.0], 0.9, 1, "non-berried"),
    ])));
    let cascade = Cascade::new(primary, WholeCrop, &PipelineConfig::default());
    let outcomes = run(&cascade, &RgbImage::new(8, 8));

    assert_eq!(outcomes.len(), 1);
    let results = outcomes[0].results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].detection.class_name, "non-berried");
  }

  #[test]
  fn primary_failure_and_unavailable_are_signalled() {
    let cascade = Cascade::new(FixedPrimary(Err(())), WholeCrop, &PipelineConfig::default());
    let outcomes = run(&cascade, &RgbImage::new(8, 8));
    assert!(matches!(outcomes.as_slice(), [PipelineOutcome::Error(msg)] if !msg.is_empty()));

    let cascade = Cascade::new(FixedPrimary(Ok(None)), WholeCrop, &PipelineConfig::default());
    let outcomes = run(&cascade, &RgbImage::new(8, 8));
    assert!(matches!(outcomes.as_slice(), [PipelineOutcome::Unavailable]));
  }
}
