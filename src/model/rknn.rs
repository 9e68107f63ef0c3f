// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/rknn.rs - RKNN 推理后端
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

use std::sync::{Mutex, PoisonError};

use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{InputTensor, TensorFormat},
  model::{EngineOutput, EngineShapes, InferenceEngine},
};

const RKNN_NUM_INPUTS: u32 = 1;
const RKNN_NUM_OUTPUTS: u32 = 2;
const DETECTIONS_OUTPUT: usize = 0;
const PROTOTYPES_OUTPUT: usize = 1;

#[derive(Error, Debug)]
pub enum RknnEngineError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("张量形状参数错误: {0}")]
  ShapeError(String),
}

impl From<std::io::Error> for RknnEngineError {
  fn from(err: std::io::Error) -> Self {
    RknnEngineError::ModelLoadError(err)
  }
}

impl From<rknpu::Error> for RknnEngineError {
  fn from(err: rknpu::Error) -> Self {
    RknnEngineError::RknnError(err)
  }
}

impl RknnEngineError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnEngineError::ModelInvalid(msg.to_string(), e)
  }
}

/// 形如 `1,640,640,3` 的形状参数
fn parse_shape(name: &str, value: &str) -> Result<Vec<usize>, RknnEngineError> {
  value
    .split(',')
    .map(|dim| dim.trim().parse::<usize>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| RknnEngineError::ShapeError(format!("{} = '{}': {}", name, value, e)))
}

/// 由 `rknn:///path/model.rknn?input=..&detections=..&prototypes=..` 构造
///
/// 形状参数缺失时引擎仍可构造，但流水线会报告形状不可用。
pub struct RknnEngineBuilder {
  model_path: String,
  flags: InitFlags,
  shapes: EngineShapes,
}

impl FromUrlWithScheme for RknnEngineBuilder {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RknnEngineBuilder {
  type Error = RknnEngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknnEngineError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut shapes = EngineShapes::default();
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "input" => shapes.input = parse_shape("input", &value)?,
        "detections" => shapes.detections = parse_shape("detections", &value)?,
        "prototypes" => shapes.prototypes = parse_shape("prototypes", &value)?,
        _ => debug!("忽略未知参数 {}", key),
      }
    }

    Ok(RknnEngineBuilder {
      model_path: url.path().to_string(),
      flags: InitFlags::default(),
      shapes,
    })
  }
}

impl RknnEngineBuilder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn build(self) -> Result<RknnEngine, RknnEngineError> {
    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let context = Context::new(&model_data, self.flags)?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnEngineError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnEngineError::invalid("无法获取输出数量", e))?;

    if num_inputs != RKNN_NUM_INPUTS || num_outputs != RKNN_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        RKNN_NUM_INPUTS, RKNN_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(RknnEngineError::invalid(&msg, rknpu::Error::InvalidModel));
    }

    info!("模型加载完成, 张量形状: {:?}", self.shapes);
    Ok(RknnEngine {
      context: Mutex::new(context),
      shapes: self.shapes,
    })
  }
}

/// NPU 上下文不可并发使用，推理调用串行化
pub struct RknnEngine {
  context: Mutex<Context>,
  shapes: EngineShapes,
}

impl RknnEngine {
  /// 模型在转换时内置 `/255` 归一化，输入还原为 8 位像素
  fn quantize(input: &InputTensor) -> Vec<u8> {
    input
      .as_slice()
      .iter()
      .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
      .collect()
  }
}

impl InferenceEngine for RknnEngine {
  type Error = RknnEngineError;

  fn shapes(&self) -> EngineShapes {
    self.shapes.clone()
  }

  fn infer(&self, input: &InputTensor) -> Result<EngineOutput, Self::Error> {
    let pixels = Self::quantize(input);
    let format = match input.format() {
      TensorFormat::NHWC => rknpu::TensorFormat::NHWC,
      TensorFormat::NCHW => rknpu::TensorFormat::NCHW,
    };

    let context = self.context.lock().unwrap_or_else(PoisonError::into_inner);
    context.set_input(0, &pixels, format, TensorType::UInt8)?;
    context.run()?;
    let output = context.get_outputs()?;

    let detections = output.get_f32(DETECTIONS_OUTPUT)?.to_vec();
    let prototypes = output.get_f32(PROTOTYPES_OUTPUT)?.to_vec();
    debug!(
      "模型输出大小: 检测 {}, 原型 {}",
      detections.len(),
      prototypes.len()
    );

    Ok(EngineOutput {
      detections,
      prototypes,
    })
  }
}
