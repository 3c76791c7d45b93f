// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 阶段间缓冲区
//!
//! - RawBuffer: 采集 → 推理, 有界队列, 满时丢弃新帧, 生产方从不阻塞
//! - FrameSlot: 推理 → 推流, 只保留最新一帧, 每个客户端独立游标

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tokio::sync::watch;

use crate::input::Frame;

/// 原始帧缓冲 (crossbeam 有界通道)
#[derive(Clone)]
pub struct RawBuffer {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
}

impl RawBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// 非阻塞入队; 队列已满时丢弃该帧并返回 `false`
    pub fn offer(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            // 两端都由自身持有, 不会断开
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// 等待下一帧, 超时返回 `None` (调用方借此检查退出标志)
    pub fn take(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// 已标注并编码的帧, 所有订阅者只读共享
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub seq: u64,
    pub jpeg: Arc<Vec<u8>>,
}

/// 输出槽: 最新值覆盖旧值 (tokio watch)
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<AnnotatedFrame>>>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// 发布新帧, 未被取走的旧帧直接被替换
    pub fn publish(&self, frame: AnnotatedFrame) {
        self.tx.send_replace(Some(frame));
    }

    /// 当前帧 (不影响任何订阅者的游标)
    pub fn latest(&self) -> Option<AnnotatedFrame> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> FrameSubscriber {
        FrameSubscriber {
            rx: self.tx.subscribe(),
            fresh: true,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// 单个客户端的读取游标
pub struct FrameSubscriber {
    rx: watch::Receiver<Option<AnnotatedFrame>>,
    fresh: bool, // 新连接先拿到当前帧
}

impl FrameSubscriber {
    /// 等待比上一次更新的帧; 发布端关闭后返回 `None`
    pub async fn next(&mut self) -> Option<AnnotatedFrame> {
        if let Some(frame) = self.take_current() {
            return Some(frame);
        }
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(frame) = self.rx.borrow_and_update().clone() {
                return Some(frame);
            }
        }
    }

    /// 非阻塞版本: 没有新帧时返回 `None`
    pub fn try_next(&mut self) -> Option<AnnotatedFrame> {
        if let Some(frame) = self.take_current() {
            return Some(frame);
        }
        match self.rx.has_changed() {
            Ok(true) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }

    fn take_current(&mut self) -> Option<AnnotatedFrame> {
        if !self.fresh {
            return None;
        }
        self.fresh = false;
        self.rx.borrow_and_update().clone()
    }
}
