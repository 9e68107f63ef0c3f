// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 推理任务
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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{thread, time::Duration};

use anyhow::anyhow;
use image::RgbImage;
use tracing::{info, warn};

use crate::{
  input::LatestFrame,
  output::Render,
  pipeline::{Pipeline, PipelineOutcome},
};

pub trait Task<I, P, O>: Sized {
  type Error;
  fn run_task(self, input: I, pipeline: P, output: O) -> Result<(), Self::Error>;
}

/// 同步等待一帧的处理结果；回调可能在其他线程触发
pub fn process_frame<P: Pipeline>(pipeline: &P, frame: &RgbImage) -> anyhow::Result<PipelineOutcome> {
  let (tx, rx) = std::sync::mpsc::channel();
  pipeline.process(frame, move |outcome| {
    let _ = tx.send(outcome);
  });
  rx.recv().map_err(|_| anyhow!("流水线没有返回结果"))
}

fn log_outcome(frame_index: usize, outcome: &PipelineOutcome) {
  match outcome {
    PipelineOutcome::Results { results, timing } => info!(
      "第 {} 帧: {} 个结果, 预处理 {:.2?} / 推理 {:.2?} / 后处理 {:.2?}",
      frame_index,
      results.len(),
      timing.preprocess,
      timing.inference,
      timing.postprocess
    ),
    PipelineOutcome::Empty => info!("第 {} 帧: 没有检测结果", frame_index),
    PipelineOutcome::Unavailable => warn!("第 {} 帧: 模型张量形状未知, 未执行推理", frame_index),
    PipelineOutcome::Error(message) => warn!("第 {} 帧: 处理失败: {}", frame_index, message),
  }
}

pub struct OneShotTask;

impl<RE, I, P, O> Task<I, P, O> for OneShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = RgbImage>,
  P: Pipeline,
  O: Render<RgbImage, PipelineOutcome, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pipeline: P, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = std::time::Instant::now();
    let outcome = process_frame(&pipeline, &frame)?;
    let elapsed = now.elapsed();
    log_outcome(1, &outcome);
    info!("推理完成，耗时: {:.2?}", elapsed);
    output.render_result(&frame, &outcome)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 连续处理
///
/// 默认只处理最新帧：读取线程不断覆盖帧槽，处理线程完成一帧后再取下一帧，
/// 处理期间到达的旧帧被丢弃，正在处理的帧不会被取消。
#[derive(Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  latest_only: bool,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      latest_only: true,
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 关闭后逐帧处理全部输入
  pub fn with_latest_only(mut self, latest_only: bool) -> Self {
    self.latest_only = latest_only;
    self
  }

  fn reached_limit(&self, frame_index: usize) -> bool {
    self.frame_number.is_some_and(|n| frame_index >= n)
  }

  fn install_interrupt(stop: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      stop.store(true, Ordering::SeqCst);
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    });
    if let Err(e) = result {
      warn!("无法设置中断处理: {}", e);
    }
  }

  fn handle<P, O, RE>(
    &self,
    frame_index: usize,
    frame: &RgbImage,
    pipeline: &P,
    output: &O,
  ) -> anyhow::Result<()>
  where
    RE: std::error::Error + Sync + Send + 'static,
    P: Pipeline,
    O: Render<RgbImage, PipelineOutcome, Error = RE>,
  {
    let now = std::time::Instant::now();
    let outcome = process_frame(pipeline, frame)?;
    let elapsed_a = now.elapsed();
    log_outcome(frame_index, &outcome);
    output.render_result(frame, &outcome)?;
    info!("推理完成，耗时: {:.2?} / {:.2?}", elapsed_a, now.elapsed());
    Ok(())
  }

  fn consume<P, O, RE>(
    &self,
    slot: &LatestFrame<RgbImage>,
    pipeline: &P,
    output: &O,
    stop: &AtomicBool,
  ) -> anyhow::Result<()>
  where
    RE: std::error::Error + Sync + Send + 'static,
    P: Pipeline,
    O: Render<RgbImage, PipelineOutcome, Error = RE>,
  {
    let mut frame_index = 0usize;
    while let Some(frame) = slot.take() {
      frame_index = frame_index.wrapping_add(1);
      self.handle(frame_index, &frame, pipeline, output)?;
      if self.reached_limit(frame_index) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if stop.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }
    if slot.dropped() > 0 {
      info!("共丢弃 {} 个过期帧", slot.dropped());
    }
    Ok(())
  }

  fn run_latest<I, P, O, RE>(
    &self,
    input: I,
    pipeline: &P,
    output: &O,
    stop: &AtomicBool,
  ) -> anyhow::Result<()>
  where
    RE: std::error::Error + Sync + Send + 'static,
    I: Iterator<Item = RgbImage> + Send,
    P: Pipeline,
    O: Render<RgbImage, PipelineOutcome, Error = RE>,
  {
    let slot = LatestFrame::new();

    thread::scope(|scope| {
      scope.spawn(|| {
        for frame in input {
          if stop.load(Ordering::SeqCst) || slot.is_closed() {
            break;
          }
          slot.push(frame);
        }
        slot.close();
      });

      let result = self.consume(&slot, pipeline, output, stop);

      stop.store(true, Ordering::SeqCst);
      slot.close();
      result
    })
  }

  fn run_sequential<I, P, O, RE>(
    &self,
    input: I,
    pipeline: &P,
    output: &O,
    stop: &AtomicBool,
  ) -> anyhow::Result<()>
  where
    RE: std::error::Error + Sync + Send + 'static,
    I: Iterator<Item = RgbImage>,
    P: Pipeline,
    O: Render<RgbImage, PipelineOutcome, Error = RE>,
  {
    for (i, frame) in input.enumerate() {
      let frame_index = i + 1;
      self.handle(frame_index, &frame, pipeline, output)?;
      if self.reached_limit(frame_index) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if stop.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }
    Ok(())
  }
}

impl<RE, I, P, O> Task<I, P, O> for ContinuousTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = RgbImage> + Send,
  P: Pipeline,
  O: Render<RgbImage, PipelineOutcome, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: P, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let stop = Arc::new(AtomicBool::new(false));
    Self::install_interrupt(stop.clone());

    if self.latest_only {
      self.run_latest(input, &pipeline, &output, &stop)?;
    } else {
      self.run_sequential(input, &pipeline, &output, &stop)?;
    }

    info!("任务完成，退出");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  struct CountingPipeline;

  impl Pipeline for CountingPipeline {
    fn process<F>(&self, frame: &RgbImage, sink: F)
    where
      F: FnOnce(PipelineOutcome) + Send,
    {
      if frame.width() == 0 {
        sink(PipelineOutcome::Empty);
      } else {
        sink(PipelineOutcome::Unavailable);
      }
    }
  }

  #[derive(Default)]
  struct Collect(Mutex<Vec<(u32, bool)>>);

  impl Render<RgbImage, PipelineOutcome> for &Collect {
    type Error = std::io::Error;

    fn render_result(&self, frame: &RgbImage, result: &PipelineOutcome) -> Result<(), Self::Error> {
      let empty = matches!(result, PipelineOutcome::Empty);
      self.0.lock().unwrap().push((frame.width(), empty));
      Ok(())
    }
  }

  fn frames(widths: &[u32]) -> Vec<RgbImage> {
    widths.iter().map(|&w| RgbImage::new(w, 1)).collect()
  }

  #[test]
  fn one_shot_renders_first_frame_only() {
    let collect = Collect::default();
    OneShotTask
      .run_task(frames(&[0, 2]).into_iter(), CountingPipeline, &collect)
      .unwrap();
    assert_eq!(*collect.0.lock().unwrap(), vec![(0, true)]);
  }

  #[test]
  fn one_shot_without_frames_fails() {
    let collect = Collect::default();
    let result = OneShotTask.run_task(std::iter::empty::<RgbImage>(), CountingPipeline, &collect);
    assert!(result.is_err());
  }

  #[test]
  fn sequential_mode_respects_frame_limit() {
    let collect = Collect::default();
    ContinuousTask::default()
      .with_latest_only(false)
      .with_frame_number(Some(2))
      .run_task(frames(&[1, 2, 3]).into_iter(), CountingPipeline, &collect)
      .unwrap();
    assert_eq!(*collect.0.lock().unwrap(), vec![(1, false), (2, false)]);
  }

  #[test]
  fn latest_mode_always_processes_the_final_frame() {
    let collect = Collect::default();
    ContinuousTask::default()
      .run_task(frames(&[1, 2, 3, 4, 5]).into_iter(), CountingPipeline, &collect)
      .unwrap();
    let seen = collect.0.lock().unwrap();
    assert!(!seen.is_empty());
    assert_eq!(seen.last().map(|s| s.0), Some(5));
    assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
  }
}
