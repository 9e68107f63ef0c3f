// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Datelike, Utc};
use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::SegmentationResult,
  output::{ComposeError, Compositor, Render, compose_on_frame, compositor_from_url},
  pipeline::PipelineOutcome,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("绘制错误: {0}")]
  ComposeError(#[from] ComposeError),
}

/// 文本记录：每个结果一行
#[derive(Debug, Clone, Copy)]
pub struct Record {
  pub label_with_name: bool,
  pub activation_threshold: f32,
}

impl Record {
  pub fn line(&self, result: &SegmentationResult) -> String {
    let detection = &result.detection;
    let name = if self.label_with_name {
      detection.class_name.clone()
    } else {
      detection.class_index.to_string()
    };
    format!(
      "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}, {}",
      name,
      detection.confidence,
      detection.x1,
      detection.y1,
      detection.x2,
      detection.y2,
      result.mask.count_above(self.activation_threshold)
    )
  }

  pub fn record(&self, results: &[SegmentationResult], path: &Path) -> Result<(), std::io::Error> {
    let lines: Vec<String> = results.iter().map(|r| self.line(r)).collect();
    std::fs::write(path.with_extension("txt"), lines.join("\n"))
  }
}

enum RecordKind {
  Draw,
  Record(Record),
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  kind: RecordKind,
  compositor: Compositor,
  frame_counter: Mutex<u16>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let kind = match uri.query_pairs().find(|(k, _)| k == "record") {
      Some((_, v)) => RecordKind::Record(Record {
        label_with_name: v != "id",
        activation_threshold: crate::config::DEFAULT_MASK_ACTIVATION_THRESHOLD,
      }),
      None => RecordKind::Draw,
    };
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      kind,
      compositor: compositor_from_url(uri)?,
      frame_counter: Mutex::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn with_compositor(mut self, compositor: Compositor) -> Self {
    self.compositor = compositor;
    self
  }

  fn frame_id(&self) -> u16 {
    let mut counter = self
      .frame_counter
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *counter = counter.wrapping_add(1);
    *counter
  }

  /// `<目录>/<年>/<月>/<日>/<时-分-秒>-<帧号>.png`
  fn frame_path(&self, now: DateTime<Utc>) -> Result<PathBuf, DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<RgbImage, PipelineOutcome> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbImage, result: &PipelineOutcome) -> Result<(), Self::Error> {
    let results = result.results();
    if !self.always && results.is_empty() {
      return Ok(());
    }

    let path = self.frame_path(Utc::now())?;
    match &self.kind {
      RecordKind::Draw => compose_on_frame(&self.compositor, frame, result)?.save(&path)?,
      RecordKind::Record(record) => {
        frame.save(&path)?;
        record.record(results, &path)?;
      }
    }
    debug!("记录帧到 {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{DetectionBox, Mask};

  #[test]
  fn record_line_lists_box_and_activated_area() {
    let mut mask = Mask::zeros(4, 4);
    mask.set(0, 0, 0.9);
    mask.set(1, 0, 0.2);
    let result = SegmentationResult {
      detection: DetectionBox::from_corners([0.1, 0.2, 0.3, 0.4], 0.75, 1, "non-berried"),
      mask,
    };

    let by_name = Record {
      label_with_name: true,
      activation_threshold: 0.3,
    };
    assert_eq!(
      by_name.line(&result),
      "non-berried, 0.7500, 0.1000, 0.2000, 0.3000, 0.4000, 1"
    );
    let by_id = Record {
      label_with_name: false,
      ..by_name
    };
    assert!(by_id.line(&result).starts_with("1, 0.7500"));
  }

  #[test]
  fn frame_ids_increase() {
    let url = url::Url::parse("folder:///tmp/records?record=id&always").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert!(output.always);
    assert!(matches!(
      output.kind,
      RecordKind::Record(Record {
        label_with_name: false,
        ..
      })
    ));
    assert_eq!(output.frame_id(), 1);
    assert_eq!(output.frame_id(), 2);
  }
}
