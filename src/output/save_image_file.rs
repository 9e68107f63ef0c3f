// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{ComposeError, Compositor, Render, compose_on_frame, compositor_from_url},
  pipeline::PipelineOutcome,
};

/// 保存方式：叠加到帧上，或只保存透明叠加层
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveMode {
  Overlay,
  Mask,
}

pub struct SaveImageFileOutput {
  path: PathBuf,
  mode: SaveMode,
  compositor: Compositor,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("绘制错误: {0}")]
  ComposeError(#[from] ComposeError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let mode = match uri.query_pairs().find(|(k, _)| k == "mode") {
      Some((_, v)) if v == "mask" => SaveMode::Mask,
      _ => SaveMode::Overlay,
    };

    Ok(SaveImageFileOutput {
      path: PathBuf::from(uri.path()),
      mode,
      compositor: compositor_from_url(uri)?,
    })
  }
}

impl SaveImageFileOutput {
  pub fn with_compositor(mut self, compositor: Compositor) -> Self {
    self.compositor = compositor;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn prepare_parent(&self) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    Ok(())
  }
}

impl Render<RgbImage, PipelineOutcome> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, frame: &RgbImage, result: &PipelineOutcome) -> Result<(), Self::Error> {
    self.prepare_parent()?;
    match self.mode {
      SaveMode::Overlay => compose_on_frame(&self.compositor, frame, result)?.save(&self.path)?,
      SaveMode::Mask => self.compositor.compose(result.results())?.save(&self.path)?,
    }
    info!("保存图像到文件: {}", self.path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scheme_and_mode_come_from_url() {
    let url = Url::parse("image:///tmp/out/result.png?mode=mask").unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), Path::new("/tmp/out/result.png"));
    assert_eq!(output.mode, SaveMode::Mask);

    let url = Url::parse("folder:///tmp/out").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn missing_font_is_reported() {
    let url = Url::parse("image:///tmp/out.png?font=/nonexistent/font.ttf").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::ComposeError(ComposeError::IoError(_)))
    ));
  }
}
