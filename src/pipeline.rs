// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 流水线接口
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

use image::RgbImage;
use tracing::error;

use crate::model::{
  InferenceEngine, MaskScaler, PipelineTiming, RegionSegmenter, Segmentation, SegmentationResult,
  Segmenter,
};

/// 一帧处理的最终结果，每次处理恰好产生一个
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
  Results {
    results: Vec<SegmentationResult>,
    timing: PipelineTiming,
  },
  /// 没有检测通过过滤
  Empty,
  /// 张量形状未解析，推理没有执行
  Unavailable,
  Error(String),
}

impl PipelineOutcome {
  pub fn results(&self) -> &[SegmentationResult] {
    match self {
      PipelineOutcome::Results { results, .. } => results,
      _ => &[],
    }
  }
}

pub trait Pipeline {
  /// 处理一帧，`sink` 恰好被调用一次；调用可能发生在其他线程
  fn process<F>(&self, frame: &RgbImage, sink: F)
  where
    F: FnOnce(PipelineOutcome) + Send;
}

/// 单阶段：直接对整帧分割
impl<E: InferenceEngine, S: MaskScaler> Pipeline for Segmenter<E, S> {
  fn process<F>(&self, frame: &RgbImage, sink: F)
  where
    F: FnOnce(PipelineOutcome) + Send,
  {
    let outcome = match self.segment(frame) {
      Ok(Segmentation::Found { result, timing }) => PipelineOutcome::Results {
        results: vec![result],
        timing,
      },
      Ok(Segmentation::Empty { .. }) => PipelineOutcome::Empty,
      Ok(Segmentation::Unavailable) => PipelineOutcome::Unavailable,
      Err(e) => {
        error!("分割失败: {}", e);
        PipelineOutcome::Error(e.to_string())
      }
    };
    sink(outcome);
  }
}

/// 运行模式：单阶段分割整帧，或两阶段级联
pub enum PipelineMode<S, C> {
  SingleStage(S),
  Cascade(C),
}

impl<S: Pipeline, C: Pipeline> Pipeline for PipelineMode<S, C> {
  fn process<F>(&self, frame: &RgbImage, sink: F)
  where
    F: FnOnce(PipelineOutcome) + Send,
  {
    match self {
      PipelineMode::SingleStage(pipeline) => pipeline.process(frame, sink),
      PipelineMode::Cascade(pipeline) => pipeline.process(frame, sink),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixed(fn() -> PipelineOutcome);

  impl Pipeline for Fixed {
    fn process<F>(&self, _frame: &RgbImage, sink: F)
    where
      F: FnOnce(PipelineOutcome) + Send,
    {
      sink((self.0)());
    }
  }

  fn outcome_of<P: Pipeline>(pipeline: &P) -> PipelineOutcome {
    let mut out = None;
    pipeline.process(&RgbImage::new(1, 1), |o| out = Some(o));
    out.unwrap()
  }

  #[test]
  fn mode_dispatches_to_selected_pipeline() {
    let single: PipelineMode<Fixed, Fixed> =
      PipelineMode::SingleStage(Fixed(|| PipelineOutcome::Empty));
    assert!(matches!(outcome_of(&single), PipelineOutcome::Empty));

    let cascade: PipelineMode<Fixed, Fixed> =
      PipelineMode::Cascade(Fixed(|| PipelineOutcome::Unavailable));
    assert!(matches!(outcome_of(&cascade), PipelineOutcome::Unavailable));
  }

  #[test]
  fn only_results_expose_results() {
    assert!(PipelineOutcome::Error("boom".into()).results().is_empty());
    let outcome = PipelineOutcome::Results {
      results: Vec::new(),
      timing: PipelineTiming::default(),
    };
    assert!(outcome.results().is_empty());
  }
}
