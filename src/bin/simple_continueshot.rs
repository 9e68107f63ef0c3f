// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_continueshot.rs - 连续帧检测与分割
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_seg::{
  FromUrl,
  cascade::Cascade,
  config::PipelineConfig,
  input::InputWrapper,
  model::{Detector, LabelTable, RknnEngineBuilder, Segmenter},
  output::{Compositor, OutputWrapper},
  pipeline::PipelineMode,
  task::{ContinuousTask, Task},
};
use tracing::{info, warn};

/// Shanan 分割参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 分割模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 第一阶段检测模型，缺省时只对整帧做单阶段分割
  #[arg(long, value_name = "DETECTOR")]
  pub detector: Option<Url>,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
  #[arg(long, default_value_t = 0.5, value_name = "THRESHOLD")]
  pub confidence: f32,
  #[arg(long, default_value_t = 0.3, value_name = "THRESHOLD")]
  pub secondary_confidence: f32,
  #[arg(long, default_value_t = 0.5, value_name = "THRESHOLD")]
  pub iou: f32,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
  /// 逐帧处理全部输入，不丢弃过期帧
  #[arg(long)]
  pub every_frame: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = PipelineConfig::default()
    .with_confidence_threshold(args.confidence)
    .with_secondary_confidence_threshold(args.secondary_confidence)
    .with_iou_threshold(args.iou);
  let labels = match &args.labels {
    Some(path) => LabelTable::from_json_file(path)?,
    None => LabelTable::default(),
  };

  let engine = RknnEngineBuilder::from_url(&args.model)?.build()?;
  let segmenter = Segmenter::new(engine, labels.clone(), &config);
  let pipeline = match &args.detector {
    Some(url) => {
      let engine = RknnEngineBuilder::from_url(url)?.build()?;
      let detector = Detector::new(engine, labels, &config);
      PipelineMode::Cascade(Cascade::new(detector, segmenter, &config))
    }
    None => PipelineMode::SingleStage(segmenter),
  };

  let mut compositor = Compositor::new(&config);
  if let Some(font) = &args.font {
    compositor = compositor.with_font_file(font)?;
  }
  if !compositor.has_font() {
    warn!("未指定字体 (--font), 标签只绘制背景, 不绘制文字");
  }

  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?.with_compositor(compositor);

  ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .with_latest_only(!args.every_frame)
    .run_task(input, pipeline, output)?;

  Ok(())
}
