// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/segmenter.rs - 检测与分割单元
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
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::frame::InputTensor;
use crate::model::{
  DetectionBox, Detections, EngineOutput, InferenceEngine, LabelTable, MaskPrototypes,
  MaskScaler, NearestScaler, PipelineTiming, PrimaryDetector, RegionSegmenter, SegmentError,
  Segmentation, SegmentationResult, TensorLayout, decode_detections, non_max_suppression,
  reconstruct_mask, select_central,
};

struct Inference {
  layout: TensorLayout,
  boxes: Vec<DetectionBox>,
  output: EngineOutput,
  timing: PipelineTiming,
}

/// 解码 + NMS，输出全部幸存检测框
pub struct Detector<E> {
  engine: E,
  layout: Option<TensorLayout>,
  labels: LabelTable,
  confidence_threshold: f32,
  iou_threshold: f32,
}

impl<E: InferenceEngine> Detector<E> {
  pub fn new(engine: E, labels: LabelTable, config: &PipelineConfig) -> Self {
    let layout = TensorLayout::resolve(&engine.shapes());
    if layout.is_none() {
      warn!("无法解析模型张量形状, 推理将不会执行");
    }
    Self {
      engine,
      layout,
      labels,
      confidence_threshold: config.confidence_threshold,
      iou_threshold: config.iou_threshold,
    }
  }

  pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn layout(&self) -> Option<&TensorLayout> {
    self.layout.as_ref()
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  fn run(&self, image: &RgbImage) -> Result<Option<Inference>, SegmentError> {
    let Some(layout) = self.layout else {
      debug!("张量形状未解析, 跳过推理");
      return Ok(None);
    };

    let start = Instant::now();
    let input = InputTensor::from_image(image, &layout.input);
    let preprocess = start.elapsed();

    let start = Instant::now();
    let output = self.engine.infer(&input).map_err(SegmentError::engine)?;
    let inference = start.elapsed();

    let start = Instant::now();
    let candidates = decode_detections(
      &output.detections,
      &layout.detections,
      self.confidence_threshold,
      &self.labels,
    )?;
    let boxes = non_max_suppression(candidates, self.iou_threshold);
    let postprocess = start.elapsed();

    Ok(Some(Inference {
      layout,
      boxes,
      output,
      timing: PipelineTiming {
        preprocess,
        inference,
        postprocess,
      },
    }))
  }
}

impl<E: InferenceEngine> PrimaryDetector for Detector<E> {
  fn detect(&self, image: &RgbImage) -> Result<Option<Detections>, SegmentError> {
    Ok(self.run(image)?.map(|inference| Detections {
      boxes: inference.boxes,
      timing: inference.timing,
    }))
  }
}

/// 单次"检测"单元：解码、NMS、选取中心框并重建掩码
///
/// 每次调用至多产生一个结果，掩码尺寸与输入图像一致。
pub struct Segmenter<E, S = NearestScaler> {
  detector: Detector<E>,
  scaler: S,
}

impl<E: InferenceEngine> Segmenter<E> {
  pub fn new(engine: E, labels: LabelTable, config: &PipelineConfig) -> Self {
    Self {
      detector: Detector::new(engine, labels, config),
      scaler: NearestScaler,
    }
  }
}

impl<E, S> Segmenter<E, S> {
  pub fn with_scaler<T: MaskScaler>(self, scaler: T) -> Segmenter<E, T> {
    Segmenter {
      detector: self.detector,
      scaler,
    }
  }

  pub fn detector(&self) -> &Detector<E> {
    &self.detector
  }
}

impl<E: InferenceEngine, S: MaskScaler> RegionSegmenter for Segmenter<E, S> {
  fn segment(&self, image: &RgbImage) -> Result<Segmentation, SegmentError> {
    let Some(Inference {
      layout,
      boxes,
      output,
      mut timing,
    }) = self.detector.run(image)?
    else {
      return Ok(Segmentation::Unavailable);
    };

    let start = Instant::now();
    let Some(central) = select_central(&boxes) else {
      timing.postprocess += start.elapsed();
      debug!("没有检测框通过过滤");
      return Ok(Segmentation::Empty { timing });
    };

    let prototypes = MaskPrototypes::from_tensor(&output.prototypes, &layout.prototypes)?;
    let mask = reconstruct_mask(
      &prototypes,
      central,
      image.width(),
      image.height(),
      &self.scaler,
    );
    timing.postprocess += start.elapsed();

    debug!(
      "选中检测框 {} ({:.2}) [{:.3}, {:.3}, {:.3}, {:.3}]",
      central.class_name, central.confidence, central.x1, central.y1, central.x2, central.y2
    );
    Ok(Segmentation::Found {
      result: SegmentationResult {
        detection: central.clone(),
        mask,
      },
      timing,
    })
  }
}
