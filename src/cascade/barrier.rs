// 该文件是 Shanan （山南西风） 项目的一部分。
// src/cascade/barrier.rs - 完成屏障
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

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::model::PipelineTiming;

struct BarrierState<T, F> {
  pending: usize,
  results: Vec<T>,
  timing: PipelineTiming,
  on_complete: Option<F>,
}

/// 完成屏障
///
/// 创建时固定子任务总数。每个子任务无论成功、无结果还是失败，都必须调用且只调用一次
/// [`CompletionBarrier::arrive`]。计数归零时以累计结果与累计耗时调用一次完成回调。
/// 计数、结果列表与耗时由同一把锁保护，回调在锁外执行。
pub struct CompletionBarrier<T, F>
where
  F: FnOnce(Vec<T>, PipelineTiming),
{
  state: Mutex<BarrierState<T, F>>,
}

impl<T, F> CompletionBarrier<T, F>
where
  F: FnOnce(Vec<T>, PipelineTiming),
{
  /// `expected` 为 0 时立即以空结果调用回调
  pub fn new(expected: usize, timing: PipelineTiming, on_complete: F) -> Self {
    let on_complete = if expected == 0 {
      debug!("没有子任务, 立即完成");
      on_complete(Vec::new(), timing);
      None
    } else {
      Some(on_complete)
    };

    Self {
      state: Mutex::new(BarrierState {
        pending: expected,
        results: Vec::with_capacity(expected),
        timing,
        on_complete,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, BarrierState<T, F>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 记录一个子任务完成，返回本次调用是否触发了完成回调
  pub fn arrive(&self, result: Option<T>, timing: PipelineTiming) -> bool {
    let fire = {
      let mut state = self.lock();
      if state.pending == 0 {
        warn!("屏障已完成, 忽略多余的完成通知");
        return false;
      }

      state.pending -= 1;
      state.timing += timing;
      if let Some(result) = result {
        state.results.push(result);
      }

      if state.pending == 0 {
        let results = std::mem::take(&mut state.results);
        let timing = state.timing;
        state.on_complete.take().map(|f| (f, results, timing))
      } else {
        None
      }
    };

    match fire {
      Some((on_complete, results, timing)) => {
        debug!("全部子任务完成, 共 {} 个结果", results.len());
        on_complete(results, timing);
        true
      }
      None => false,
    }
  }

  pub fn pending(&self) -> usize {
    self.lock().pending
  }

  pub fn is_complete(&self) -> bool {
    self.pending() == 0
  }
}
