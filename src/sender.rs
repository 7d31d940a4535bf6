//! 송신자
//!
//! Chunker → 압축 어댑터 → 프레임 코덱 → 백프레셔 조절기 순서로 페이로드를 흘려보낸다.
//!
//! ```text
//! Idle → MetadataSent → (SendingChunk)* → CompletionSent → Idle
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backpressure::BackpressureGovernor;
use crate::channel::DataChannel;
use crate::chunk::{ChunkIndex, Chunker};
use crate::compression::{CodecOutput, CompressionAdapter};
use crate::message::{self, ChunkHeader, TransferMetadata};
use crate::stats::{ProgressCallback, TransferBenchmark, TransferProgress};
use crate::{Config, Error, Result};

/// 송신 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    MetadataSent,
    SendingChunk,
    CompletionSent,
}

/// 송신자
pub struct Sender {
    /// 설정
    config: Config,

    /// 전송 채널
    channel: Arc<dyn DataChannel>,

    /// 압축 어댑터
    compressor: CompressionAdapter,

    /// 백프레셔 조절기
    governor: BackpressureGovernor,

    /// 병렬 압축 풀 (parallel_workers > 1 일 때만)
    pool: Option<rayon::ThreadPool>,

    /// 현재 상태
    state: SenderState,

    /// 전송 통계
    stats: TransferBenchmark,

    /// 취소 토큰
    cancel: CancellationToken,

    /// 진행률 콜백
    progress: Option<ProgressCallback>,
}

impl Sender {
    /// 새 송신자 생성
    pub fn new(config: Config, channel: Arc<dyn DataChannel>) -> Result<Self> {
        config.validate()?;

        let pool = if config.parallel_workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.parallel_workers)
                .thread_name(|i| format!("dcxfer-compress-{}", i))
                .build()
                .map_err(|e| Error::InvalidConfig(format!("압축 풀 생성 실패: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            governor: BackpressureGovernor::from_config(&config),
            compressor: CompressionAdapter::zstd(),
            config,
            channel,
            pool,
            state: SenderState::Idle,
            stats: TransferBenchmark::new(),
            cancel: CancellationToken::new(),
            progress: None,
        })
    }

    /// 압축 코덱 교체
    pub fn with_compressor(mut self, compressor: CompressionAdapter) -> Self {
        self.compressor = compressor;
        self
    }

    /// 진행률 콜백 등록
    pub fn on_progress(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    /// 현재 전송을 취소할 수 있는 토큰
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// 마지막 전송 통계
    pub fn stats(&self) -> &TransferBenchmark {
        &self.stats
    }

    /// 코덱 준비 완료까지 대기
    pub async fn wait_codec_ready(&self) -> Result<()> {
        self.compressor.wait_ready().await
    }

    /// 페이로드 전송
    ///
    /// 진입 시 채널이 열려 있지 않으면 `ChannelNotReady`. 도중에 채널이 닫히면
    /// 재시도 없이 중단한다. 취소되면 채널에 cancel 프레임을 남기고 `Cancelled`.
    pub async fn send(
        &mut self,
        name: &str,
        mime_hint: &str,
        payload: Bytes,
    ) -> Result<TransferBenchmark> {
        if !self.channel.is_open() {
            return Err(Error::ChannelNotReady);
        }
        if self.config.compression_enabled && !self.compressor.is_ready() {
            return Err(Error::CodecUnavailable);
        }

        let chunker = Chunker::new(payload, self.config.chunk_size);
        let total_chunks = ChunkIndex::try_from(chunker.total_chunks()).map_err(|_| {
            Error::InvalidConfig(format!(
                "청크 수 {} 가 u32 범위를 초과",
                chunker.total_chunks()
            ))
        })?;

        let metadata = TransferMetadata {
            name: name.to_string(),
            total_size: chunker.total_size(),
            mime_hint: mime_hint.to_string(),
            compressed: self.config.compression_enabled,
            compression_level: if self.config.compression_enabled {
                self.config.compression_level
            } else {
                0
            },
            total_chunks,
            indexed_frames: self.config.indexed_binary_frames,
        };

        self.stats.reset();
        info!(
            "전송 시작: name={}, size={}, chunks={}, compressed={}",
            metadata.name, metadata.total_size, metadata.total_chunks, metadata.compressed
        );

        let result = self.stream(&chunker, &metadata).await;
        self.state = SenderState::Idle;

        match result {
            Ok(()) => {
                info!("전송 완료: {}", self.stats.summary());
                Ok(self.stats.clone())
            }
            Err(Error::Cancelled) => {
                self.stats.finish();
                warn!("전송 취소: name={}, sent={} chunks", metadata.name, self.stats.chunks_sent);
                if self.channel.is_open() {
                    let notice = message::encode_cancel("sender cancelled")?;
                    if let Err(e) = self.channel.send_text(notice) {
                        warn!("cancel 프레임 전송 실패: {}", e);
                    }
                }
                self.cancel = CancellationToken::new();
                Err(Error::Cancelled)
            }
            Err(e) => {
                self.stats.finish();
                warn!("전송 중단: name={}, error={}", metadata.name, e);
                Err(e)
            }
        }
    }

    async fn stream(&mut self, chunker: &Chunker, metadata: &TransferMetadata) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.channel.send_text(message::encode_metadata(metadata)?)?;
        self.state = SenderState::MetadataSent;

        let batch_size = match (&self.pool, metadata.compressed) {
            (Some(_), true) => self.config.parallel_workers,
            _ => 1,
        };

        let mut chunks = chunker.iter();
        loop {
            let batch: Vec<(ChunkIndex, Bytes)> = chunks.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }

            let encoded = self.encode_batch(&batch, metadata)?;
            for ((index, original), wire) in batch.into_iter().zip(encoded) {
                self.emit_chunk(index, &original, wire, metadata).await?;
            }
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.channel.send_text(message::encode_completion()?)?;
        self.state = SenderState::CompletionSent;
        self.stats.finish();
        Ok(())
    }

    /// 배치 단위 압축 (비압축 전송이면 그대로 통과)
    fn encode_batch(
        &self,
        batch: &[(ChunkIndex, Bytes)],
        metadata: &TransferMetadata,
    ) -> Result<Vec<CodecOutput>> {
        if !metadata.compressed {
            return Ok(batch
                .iter()
                .map(|(_, data)| CodecOutput {
                    data: data.clone(),
                    elapsed: std::time::Duration::ZERO,
                    input_len: data.len(),
                })
                .collect());
        }

        let level = metadata.compression_level;
        match &self.pool {
            Some(pool) if batch.len() > 1 => {
                let originals: Vec<Bytes> = batch.iter().map(|(_, data)| data.clone()).collect();
                self.compressor
                    .compress_batch(pool, &originals, level)
                    .into_iter()
                    .collect()
            }
            _ => batch
                .iter()
                .map(|(_, data)| self.compressor.compress(data, level))
                .collect(),
        }
    }

    async fn emit_chunk(
        &mut self,
        index: ChunkIndex,
        original: &Bytes,
        wire: CodecOutput,
        metadata: &TransferMetadata,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let wire_len = wire.data.len();
        let header = ChunkHeader {
            index,
            original_size: original.len() as u32,
            wire_size: wire_len as u32,
            checksum: self
                .config
                .chunk_checksums
                .then(|| crc32fast::hash(original)),
        };

        // 헤더와 페이로드는 항상 연속된 한 쌍으로 전송
        self.channel.send_text(message::encode_chunk_header(&header)?)?;
        self.channel
            .send_binary(message::encode_binary(index, wire.data, metadata.indexed_frames))?;
        self.state = SenderState::SendingChunk;

        self.stats.chunks_sent += 1;
        self.stats.record_chunk(original.len(), wire_len);
        self.stats.compression_time += wire.elapsed;

        debug!(
            "청크 {}/{} 전송: {} -> {} bytes",
            index + 1,
            metadata.total_chunks,
            original.len(),
            wire_len
        );

        if let Some(callback) = &self.progress {
            callback(TransferProgress {
                chunks_done: index + 1,
                total_chunks: metadata.total_chunks,
                bytes_done: self.stats.original_bytes,
                total_bytes: metadata.total_size,
            });
        }

        if self.governor.needs_drain(self.channel.as_ref()) {
            let waited = self
                .governor
                .await_drain(self.channel.as_ref(), &self.cancel)
                .await?;
            self.stats.record_drain(waited);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_channel, Frame, MemoryChannel, MemoryReceiver};
    use crate::compression::{DeferredCodec, ZstdCodec};
    use crate::message::ControlMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn drain_frames(rx: &mut MemoryReceiver) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn control(frame: &Frame) -> ControlMessage {
        match frame {
            Frame::Text(text) => ControlMessage::decode(text).unwrap(),
            other => panic!("expected control frame, got {}", other.describe()),
        }
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 7) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_frame_sequence_200000_bytes() {
        let (tx, mut rx) = memory_channel();
        let mut sender = Sender::new(Config::default(), Arc::new(tx)).unwrap();

        let bench = sender.send("a.bin", "application/octet-stream", payload(200_000)).await.unwrap();
        assert_eq!(bench.chunks_sent, 4);
        assert_eq!(bench.original_bytes, 200_000);
        assert_eq!(bench.wire_bytes, 200_000);
        assert_eq!(sender.state(), SenderState::Idle);

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 1 + 4 * 2 + 1);

        match control(&frames[0]) {
            ControlMessage::Metadata(meta) => {
                assert_eq!(meta.total_chunks, 4);
                assert_eq!(meta.total_size, 200_000);
                assert!(!meta.compressed);
            }
            other => panic!("unexpected {:?}", other),
        }

        let expected = [65536usize, 65536, 65536, 3392];
        for (i, size) in expected.iter().enumerate() {
            match control(&frames[1 + i * 2]) {
                ControlMessage::Chunk(header) => {
                    assert_eq!(header.index, i as u32);
                    assert_eq!(header.original_size as usize, *size);
                    assert_eq!(header.wire_size, header.original_size);
                    assert!(header.checksum.is_some());
                }
                other => panic!("unexpected {:?}", other),
            }
            match &frames[2 + i * 2] {
                Frame::Binary(data) => assert_eq!(data.len(), *size),
                other => panic!("expected binary, got {}", other.describe()),
            }
        }

        assert_eq!(control(&frames[9]), ControlMessage::Complete);
    }

    #[tokio::test]
    async fn test_empty_payload_sends_metadata_and_completion() {
        let (tx, mut rx) = memory_channel();
        let mut sender = Sender::new(Config::default(), Arc::new(tx)).unwrap();

        let bench = sender.send("empty.txt", "text/plain", Bytes::new()).await.unwrap();
        assert_eq!(bench.chunks_sent, 0);

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 2);
        match control(&frames[0]) {
            ControlMessage::Metadata(meta) => assert_eq!(meta.total_chunks, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(control(&frames[1]), ControlMessage::Complete);
    }

    #[tokio::test]
    async fn test_closed_channel_is_not_ready() {
        let (tx, mut rx) = memory_channel();
        tx.close();
        let mut sender = Sender::new(Config::default(), Arc::new(tx)).unwrap();

        let result = sender.send("a", "", payload(10)).await;
        assert!(matches!(result, Err(Error::ChannelNotReady)));
        assert!(drain_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_compression_requires_ready_codec() {
        let (tx, mut rx) = memory_channel();
        let (codec, handle) = DeferredCodec::new(ZstdCodec);
        let mut sender = Sender::new(Config::default().with_compression(3), Arc::new(tx))
            .unwrap()
            .with_compressor(CompressionAdapter::new(Arc::new(codec)));

        let result = sender.send("a", "", payload(1000)).await;
        assert!(matches!(result, Err(Error::CodecUnavailable)));
        assert!(drain_frames(&mut rx).is_empty());

        handle.mark_ready();
        sender.wait_codec_ready().await.unwrap();
        assert!(sender.send("a", "", payload(1000)).await.is_ok());
    }

    #[tokio::test]
    async fn test_compressed_chunks_report_wire_size() {
        let (tx, mut rx) = memory_channel();
        let config = Config {
            chunk_size: 4096,
            ..Config::default().with_compression(3)
        };
        let mut sender = Sender::new(config, Arc::new(tx)).unwrap();

        let bench = sender.send("z", "", payload(20_000)).await.unwrap();
        assert!(bench.wire_bytes < bench.original_bytes);
        assert!(bench.compression_ratio() < 1.0);

        let frames = drain_frames(&mut rx);
        for pair in frames[1..frames.len() - 1].chunks(2) {
            let header = match control(&pair[0]) {
                ControlMessage::Chunk(header) => header,
                other => panic!("unexpected {:?}", other),
            };
            match &pair[1] {
                Frame::Binary(data) => {
                    assert_eq!(data.len(), header.wire_size as usize);
                    let restored = zstd::stream::decode_all(data.as_ref()).unwrap();
                    assert_eq!(restored.len(), header.original_size as usize);
                }
                other => panic!("expected binary, got {}", other.describe()),
            }
        }
    }

    #[tokio::test]
    async fn test_parallel_compression_keeps_order() {
        let (tx, mut rx) = memory_channel();
        let config = Config {
            chunk_size: 1024,
            parallel_workers: 4,
            ..Config::default().with_compression(3)
        };
        let mut sender = Sender::new(config, Arc::new(tx)).unwrap();
        sender.send("p", "", payload(10 * 1024 + 17)).await.unwrap();

        let frames = drain_frames(&mut rx);
        let indices: Vec<u32> = frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => match ControlMessage::decode(text).unwrap() {
                    ControlMessage::Chunk(header) => Some(header.index),
                    _ => None,
                },
                Frame::Binary(_) => None,
            })
            .collect();
        assert_eq!(indices, (0..11).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_indexed_binary_frames() {
        let (tx, mut rx) = memory_channel();
        let config = Config {
            chunk_size: 100,
            indexed_binary_frames: true,
            ..Config::default()
        };
        let mut sender = Sender::new(config, Arc::new(tx)).unwrap();
        sender.send("i", "", payload(250)).await.unwrap();

        let frames = drain_frames(&mut rx);
        match control(&frames[0]) {
            ControlMessage::Metadata(meta) => assert!(meta.indexed_frames),
            other => panic!("unexpected {:?}", other),
        }
        match &frames[4] {
            Frame::Binary(data) => {
                assert_eq!(&data[..4], &1u32.to_le_bytes());
                assert_eq!(data.len(), 4 + 100);
            }
            other => panic!("expected binary, got {}", other.describe()),
        }
    }

    /// 송신마다 최대 buffered 값을 기록하는 채널
    struct RecordingChannel {
        inner: MemoryChannel,
        max_buffered: AtomicUsize,
    }

    impl DataChannel for RecordingChannel {
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn send_text(&self, text: String) -> Result<()> {
            self.inner.send_text(text)?;
            self.max_buffered
                .fetch_max(self.inner.buffered_amount(), Ordering::SeqCst);
            Ok(())
        }

        fn send_binary(&self, data: Bytes) -> Result<()> {
            self.inner.send_binary(data)?;
            self.max_buffered
                .fetch_max(self.inner.buffered_amount(), Ordering::SeqCst);
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            self.inner.buffered_amount()
        }

        fn set_buffered_amount_low_threshold(&self, threshold: usize) {
            self.inner.set_buffered_amount_low_threshold(threshold);
        }

        fn buffered_amount_low(&self) -> Option<&Notify> {
            self.inner.buffered_amount_low()
        }
    }

    #[tokio::test]
    async fn test_backpressure_bounds_queue_depth() {
        let (tx, mut rx) = memory_channel();
        let channel = Arc::new(RecordingChannel {
            inner: tx,
            max_buffered: AtomicUsize::new(0),
        });

        let chunk_size = 1000;
        let threshold = 3000;
        let config = Config {
            chunk_size,
            buffer_threshold: threshold,
            ..Config::default()
        };
        let mut sender = Sender::new(config, channel.clone()).unwrap();

        let reader = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(frame) = rx.recv().await {
                count += 1;
                tokio::time::sleep(std::time::Duration::from_micros(200)).await;
                if let Frame::Text(text) = &frame {
                    if ControlMessage::decode(text).unwrap() == ControlMessage::Complete {
                        break;
                    }
                }
            }
            count
        });

        let bench = sender.send("bp", "", payload(50 * chunk_size)).await.unwrap();
        assert!(bench.drain_waits >= 1);
        assert_eq!(reader.await.unwrap(), 1 + 50 * 2 + 1);

        // 임계값 + 청크 한 쌍(헤더 텍스트 포함)을 넘지 않음
        let max = channel.max_buffered.load(Ordering::SeqCst);
        assert!(max <= threshold + chunk_size + 256, "max buffered {}", max);
    }

    #[tokio::test]
    async fn test_cancel_between_chunks() {
        let (tx, mut rx) = memory_channel();
        let channel = Arc::new(tx);
        let config = Config {
            chunk_size: 100,
            ..Config::default()
        };
        let mut sender = Sender::new(config, channel.clone()).unwrap();

        let token = sender.cancel_token();
        sender.on_progress(Box::new(move |progress| {
            if progress.chunks_done == 2 {
                token.cancel();
            }
        }));

        let result = sender.send("c", "", payload(1000)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(sender.stats().chunks_sent, 2);
        assert!(channel.is_open());
        assert!(!sender.cancel_token().is_cancelled());

        let frames = drain_frames(&mut rx);
        assert_eq!(frames.len(), 1 + 2 * 2 + 1);
        assert_eq!(control(frames.last().unwrap()).kind(), "cancel");
    }

    #[tokio::test]
    async fn test_channel_closing_mid_transfer_aborts() {
        let (tx, rx) = memory_channel();
        let config = Config {
            chunk_size: 100,
            ..Config::default()
        };
        let mut sender = Sender::new(config, Arc::new(tx)).unwrap();

        let rx = std::sync::Mutex::new(Some(rx));
        sender.on_progress(Box::new(move |progress| {
            if progress.chunks_done == 3 {
                // 수신 절반을 버리면 채널이 닫힘
                drop(rx.lock().unwrap().take());
            }
        }));

        let result = sender.send("x", "", payload(1000)).await;
        assert!(matches!(result, Err(Error::ChannelClosed)));
        assert_eq!(sender.stats().chunks_sent, 3);
    }
}
