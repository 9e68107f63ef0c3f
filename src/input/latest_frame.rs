// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/latest_frame.rs - 仅保留最新帧的帧槽
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

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

struct Slot<T> {
  frame: Option<T>,
  closed: bool,
  dropped: u64,
}

/// 生产者与处理线程之间的单帧槽
///
/// 处理较慢时旧帧被新帧覆盖，消费者总是拿到最新的一帧。
pub struct LatestFrame<T> {
  slot: Mutex<Slot<T>>,
  ready: Condvar,
}

impl<T> Default for LatestFrame<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> LatestFrame<T> {
  pub fn new() -> Self {
    Self {
      slot: Mutex::new(Slot {
        frame: None,
        closed: false,
        dropped: 0,
      }),
      ready: Condvar::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Slot<T>> {
    self.slot.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 放入一帧，返回是否覆盖了尚未取走的旧帧；关闭后的帧被直接丢弃
  pub fn push(&self, frame: T) -> bool {
    let mut slot = self.lock();
    if slot.closed {
      return false;
    }
    let replaced = slot.frame.replace(frame).is_some();
    if replaced {
      slot.dropped += 1;
      trace!("覆盖未处理的帧");
    }
    drop(slot);
    self.ready.notify_one();
    replaced
  }

  /// 阻塞直到有帧可取；槽已关闭且为空时返回 `None`
  pub fn take(&self) -> Option<T> {
    let mut slot = self
      .ready
      .wait_while(self.lock(), |s| s.frame.is_none() && !s.closed)
      .unwrap_or_else(PoisonError::into_inner);
    slot.frame.take()
  }

  pub fn try_take(&self) -> Option<T> {
    self.lock().frame.take()
  }

  /// 关闭后仍可取走最后一帧
  pub fn close(&self) {
    self.lock().closed = true;
    self.ready.notify_all();
  }

  pub fn is_closed(&self) -> bool {
    self.lock().closed
  }

  /// 被覆盖而未处理的帧数
  pub fn dropped(&self) -> u64 {
    self.lock().dropped
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn newest_frame_wins() {
    let slot = LatestFrame::new();
    assert!(!slot.push(1));
    assert!(slot.push(2));
    assert!(slot.push(3));
    assert_eq!(slot.take(), Some(3));
    assert_eq!(slot.try_take(), None);
    assert_eq!(slot.dropped(), 2);
  }

  #[test]
  fn close_drains_then_ends() {
    let slot = LatestFrame::new();
    slot.push("last");
    assert!(!slot.is_closed());
    slot.close();
    assert!(slot.is_closed());
    assert!(!slot.push("ignored"));
    assert_eq!(slot.take(), Some("last"));
    assert_eq!(slot.take(), None);
  }

  #[test]
  fn take_blocks_until_producer_pushes() {
    let slot = LatestFrame::new();
    let received = std::thread::scope(|scope| {
      let consumer = scope.spawn(|| slot.take());
      std::thread::sleep(std::time::Duration::from_millis(20));
      slot.push(7u32);
      consumer.join().unwrap()
    });
    assert_eq!(received, Some(7));
  }
}
