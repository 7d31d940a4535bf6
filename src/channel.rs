//! 전송 채널 경계
//!
//! 코어는 채널에 대해 다음만 요구한다.
//! - 텍스트/바이너리 프레임 송신
//! - 열림 여부
//! - 송신 큐에 쌓인 바이트 수
//! - (가능하면) low-watermark 엣지 알림
//!
//! 순서 보장과 신뢰성은 전송 계층의 책임이다.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;
use tokio::sync::{mpsc, Notify};

use crate::{Error, Result};

/// 채널 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 제어 메시지 (JSON)
    Text(String),

    /// 청크 페이로드
    Binary(Bytes),
}

impl Frame {
    /// 프레임 크기 (바이트)
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 로그용 요약
    pub fn describe(&self) -> String {
        match self {
            Frame::Text(text) => format!("text({} bytes)", text.len()),
            Frame::Binary(data) => format!("binary({} bytes)", data.len()),
        }
    }
}

/// 메시지 기반 양방향 채널 (송신측)
pub trait DataChannel: Send + Sync {
    /// 채널 열림 여부
    fn is_open(&self) -> bool;

    fn send_text(&self, text: String) -> Result<()>;

    fn send_binary(&self, data: Bytes) -> Result<()>;

    /// 송신 큐에 남은 바이트 수
    fn buffered_amount(&self) -> usize;

    /// low-watermark 임계값 설정
    fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}

    /// 버퍼가 임계값 이하로 떨어질 때 깨워주는 알림
    ///
    /// None 이면 엣지 알림 미지원, 폴링으로 대체해야 함.
    fn buffered_amount_low(&self) -> Option<&Notify> {
        None
    }
}

/// 메모리 채널 공유 상태
#[derive(Debug)]
struct Shared {
    open: AtomicBool,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    low: Notify,
    edge_triggered: bool,
}

impl Shared {
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // drain 대기 중인 송신자 깨우기
        self.low.notify_one();
    }
}

/// 메모리 루프백 채널 (송신 절반)
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
}

/// 메모리 루프백 채널 (수신 절반)
///
/// 프레임을 꺼낼 때마다 송신측 buffered 카운트가 줄어든다.
#[derive(Debug)]
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
}

/// low-watermark 엣지 알림을 지원하는 메모리 채널
pub fn memory_channel() -> (MemoryChannel, MemoryReceiver) {
    build_memory_channel(true)
}

/// 엣지 알림 없이 buffered 값만 노출하는 메모리 채널
pub fn memory_channel_polled() -> (MemoryChannel, MemoryReceiver) {
    build_memory_channel(false)
}

fn build_memory_channel(edge_triggered: bool) -> (MemoryChannel, MemoryReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        open: AtomicBool::new(true),
        buffered: AtomicUsize::new(0),
        low_threshold: AtomicUsize::new(0),
        low: Notify::new(),
        edge_triggered,
    });

    (
        MemoryChannel {
            tx,
            shared: shared.clone(),
        },
        MemoryReceiver { rx, shared },
    )
}

impl MemoryChannel {
    /// 채널 닫기
    pub fn close(&self) {
        self.shared.close();
    }

    fn push(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }

        let len = frame.len();
        self.shared.buffered.fetch_add(len, Ordering::SeqCst);
        if self.tx.send(frame).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            self.shared.close();
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }
}

impl DataChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<()> {
        self.push(Frame::Text(text))
    }

    fn send_binary(&self, data: Bytes) -> Result<()> {
        self.push(Frame::Binary(data))
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.shared.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn buffered_amount_low(&self) -> Option<&Notify> {
        if self.shared.edge_triggered {
            Some(&self.shared.low)
        } else {
            None
        }
    }
}

impl MemoryReceiver {
    /// 다음 프레임 수신 (송신측이 모두 사라지면 None)
    pub async fn recv(&mut self) -> Option<Frame> {
        let frame = self.rx.recv().await?;
        self.release(frame.len());
        Some(frame)
    }

    /// 대기 없이 프레임 수신
    pub fn try_recv(&mut self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.release(frame.len());
        Some(frame)
    }

    /// 수신측에서 채널 닫기
    pub fn close(&mut self) {
        self.shared.close();
        self.rx.close();
    }

    fn release(&self, len: usize) {
        let prev = self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
        let now = prev.saturating_sub(len);
        let threshold = self.shared.low_threshold.load(Ordering::SeqCst);

        // 임계값을 위에서 아래로 넘을 때만 알림
        if self.shared.edge_triggered && prev > threshold && now <= threshold {
            self.shared.low.notify_one();
        }
    }
}

impl Stream for MemoryReceiver {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let polled = self.rx.poll_recv(cx);
        match polled {
            Poll::Ready(Some(frame)) => {
                self.release(frame.len());
                Poll::Ready(Some(frame))
            }
            other => other,
        }
    }
}

impl Drop for MemoryReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (tx, mut rx) = memory_channel();
        tx.send_text("a".into()).unwrap();
        tx.send_binary(Bytes::from_static(b"bb")).unwrap();
        tx.send_text("c".into()).unwrap();

        assert_eq!(rx.recv().await, Some(Frame::Text("a".into())));
        assert_eq!(rx.recv().await, Some(Frame::Binary(Bytes::from_static(b"bb"))));
        assert_eq!(rx.recv().await, Some(Frame::Text("c".into())));
    }

    #[tokio::test]
    async fn test_buffered_amount_tracks_queue() {
        let (tx, mut rx) = memory_channel();
        tx.send_binary(Bytes::from(vec![0u8; 100])).unwrap();
        tx.send_binary(Bytes::from(vec![0u8; 50])).unwrap();
        assert_eq!(tx.buffered_amount(), 150);

        rx.recv().await.unwrap();
        assert_eq!(tx.buffered_amount(), 50);
        rx.try_recv().unwrap();
        assert_eq!(tx.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_low_watermark_fires_on_crossing() {
        let (tx, mut rx) = memory_channel();
        tx.set_buffered_amount_low_threshold(100);
        tx.send_binary(Bytes::from(vec![0u8; 80])).unwrap();
        tx.send_binary(Bytes::from(vec![0u8; 80])).unwrap();

        let notify = tx.buffered_amount_low().unwrap();
        let notified = notify.notified();

        rx.recv().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("low watermark notification");
        assert_eq!(tx.buffered_amount(), 80);
    }

    #[tokio::test]
    async fn test_receiver_as_stream_releases_buffer() {
        use futures_util::StreamExt;

        let (tx, mut rx) = memory_channel();
        tx.send_binary(Bytes::from(vec![0u8; 40])).unwrap();
        tx.send_text("done".into()).unwrap();
        assert_eq!(tx.buffered_amount(), 44);

        assert_eq!(rx.next().await.map(|f| f.len()), Some(40));
        assert_eq!(tx.buffered_amount(), 4);
        assert_eq!(rx.next().await, Some(Frame::Text("done".into())));
        assert_eq!(tx.buffered_amount(), 0);
    }

    #[test]
    fn test_polled_channel_has_no_notification() {
        let (tx, _rx) = memory_channel_polled();
        assert!(tx.buffered_amount_low().is_none());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (tx, _rx) = memory_channel();
        tx.close();
        assert!(!tx.is_open());
        assert!(matches!(tx.send_text("x".into()), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_dropping_receiver_closes_channel() {
        let (tx, rx) = memory_channel();
        drop(rx);
        assert!(!tx.is_open());
        assert!(matches!(
            tx.send_binary(Bytes::from_static(b"x")),
            Err(Error::ChannelClosed)
        ));
    }
}
