//! 백프레셔 조절기
//!
//! 채널 송신 큐의 buffered 바이트 수를 관찰하여 임계값을 넘으면
//! low-watermark 알림(없으면 폴링)으로 drain 될 때까지 송신 루프를 멈춘다.
//! 송신 파이프라인에서 유일한 대기 지점이며 청크마다 다시 확인해야 한다.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::DataChannel;
use crate::{Config, Error, Result, DEFAULT_BUFFER_THRESHOLD};

#[derive(Debug, Clone)]
pub struct BackpressureGovernor {
    /// buffered 임계값 (바이트)
    threshold: usize,

    /// 폴링 간격 (엣지 알림 미지원 채널용)
    poll_interval: Duration,

    /// drain 최대 대기 시간
    timeout: Option<Duration>,
}

impl Default for BackpressureGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_THRESHOLD)
    }
}

impl BackpressureGovernor {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            poll_interval: Duration::from_millis(5),
            timeout: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.buffer_threshold,
            poll_interval: config.drain_poll_interval(),
            timeout: config.drain_timeout(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// 임계값 초과 여부
    pub fn should_drain(current_buffered: usize, threshold: usize) -> bool {
        current_buffered > threshold
    }

    /// 채널 현재 상태 기준 drain 필요 여부
    pub fn needs_drain(&self, channel: &dyn DataChannel) -> bool {
        Self::should_drain(channel.buffered_amount(), self.threshold)
    }

    /// buffered 가 임계값 이하가 될 때까지 대기
    ///
    /// 대기한 시간을 반환한다. 채널이 닫히면 `ChannelClosed`,
    /// 취소되면 `Cancelled`, 타임아웃이면 `DrainTimeout`.
    pub async fn await_drain(
        &self,
        channel: &dyn DataChannel,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        let started = Instant::now();

        debug!(
            "drain 대기 시작: buffered={}, threshold={}",
            channel.buffered_amount(),
            self.threshold
        );

        let drain = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, self.wait_below(channel)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::DrainTimeout {
                        buffered: channel.buffered_amount(),
                        threshold: self.threshold,
                    }),
                },
                None => self.wait_below(channel).await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = drain => result?,
        }

        let waited = started.elapsed();
        debug!("drain 완료: {:.2}ms", waited.as_secs_f64() * 1000.0);
        Ok(waited)
    }

    async fn wait_below(&self, channel: &dyn DataChannel) -> Result<()> {
        channel.set_buffered_amount_low_threshold(self.threshold);

        loop {
            if !channel.is_open() {
                return Err(Error::ChannelClosed);
            }
            if channel.buffered_amount() <= self.threshold {
                return Ok(());
            }

            match channel.buffered_amount_low() {
                Some(notify) => notify.notified().await,
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_channel, memory_channel_polled};
    use bytes::Bytes;

    #[test]
    fn test_should_drain() {
        assert!(!BackpressureGovernor::should_drain(0, 1024));
        assert!(!BackpressureGovernor::should_drain(1024, 1024));
        assert!(BackpressureGovernor::should_drain(1025, 1024));
    }

    #[tokio::test]
    async fn test_returns_immediately_below_threshold() {
        let (tx, _rx) = memory_channel();
        tx.send_binary(Bytes::from(vec![0u8; 10])).unwrap();

        let governor = BackpressureGovernor::new(100);
        assert!(!governor.needs_drain(&tx));
        governor
            .await_drain(&tx, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_low_watermark() {
        let (tx, mut rx) = memory_channel();
        for _ in 0..4 {
            tx.send_binary(Bytes::from(vec![0u8; 100])).unwrap();
        }

        let governor = BackpressureGovernor::new(150);
        assert!(governor.needs_drain(&tx));

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            while rx.recv().await.is_some() {}
        });

        governor
            .await_drain(&tx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(tx.buffered_amount() <= 150);

        tx.close();
        reader.abort();
    }

    #[tokio::test]
    async fn test_polling_fallback() {
        let (tx, mut rx) = memory_channel_polled();
        for _ in 0..3 {
            tx.send_binary(Bytes::from(vec![0u8; 100])).unwrap();
        }

        let governor = BackpressureGovernor::new(50).with_poll_interval(Duration::from_millis(1));
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for _ in 0..3 {
                rx.recv().await;
            }
            rx
        });

        governor
            .await_drain(&tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tx.buffered_amount(), 0);
        drop(reader.await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_when_nobody_reads() {
        let (tx, _rx) = memory_channel();
        tx.send_binary(Bytes::from(vec![0u8; 500])).unwrap();

        let governor = BackpressureGovernor::new(100).with_timeout(Duration::from_millis(20));
        let result = governor.await_drain(&tx, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(Error::DrainTimeout {
                buffered: 500,
                threshold: 100
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let (tx, _rx) = memory_channel();
        tx.send_binary(Bytes::from(vec![0u8; 500])).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let governor = BackpressureGovernor::new(100);
        assert!(matches!(
            governor.await_drain(&tx, &cancel).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_aborts_wait() {
        let (tx, rx) = memory_channel();
        tx.send_binary(Bytes::from(vec![0u8; 500])).unwrap();

        let governor = BackpressureGovernor::new(100);
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(rx);
        });

        assert!(matches!(
            governor.await_drain(&tx, &CancellationToken::new()).await,
            Err(Error::ChannelClosed)
        ));
        closer.await.unwrap();
    }
}
