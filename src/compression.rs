//! 압축 어댑터
//!
//! 외부에서 주입된 압축/해제 함수를 감싸서 소요 시간과 크기 변화를 기록한다.
//! 각 청크는 독립된 압축 프레임이며 호출 간 상태를 공유하지 않는다.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rayon::prelude::*;
use tokio::sync::watch;

use crate::{Error, Result};

/// 주입 가능한 압축 코덱
pub trait Codec: Send + Sync {
    /// 코덱 이름 (로그용)
    fn name(&self) -> &'static str;

    /// 코덱 사용 가능 여부
    fn is_ready(&self) -> bool {
        true
    }

    /// 준비 완료 신호 (None 이면 항상 준비됨)
    fn ready_signal(&self) -> Option<watch::Receiver<bool>> {
        None
    }

    fn compress(&self, data: &[u8], level: u8) -> io::Result<Vec<u8>>;

    /// 해제 (출력이 `max_len` 을 넘으면 에러)
    fn decompress(&self, data: &[u8], max_len: usize) -> io::Result<Vec<u8>>;
}

/// zstd 코덱 (청크마다 독립 프레임)
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8], level: u8) -> io::Result<Vec<u8>> {
        zstd::bulk::compress(data, i32::from(level))
    }

    fn decompress(&self, data: &[u8], max_len: usize) -> io::Result<Vec<u8>> {
        zstd::bulk::decompress(data, max_len)
    }
}

/// 비동기 초기화가 끝나야 사용할 수 있는 코덱 래퍼
///
/// 짝이 되는 [`CodecReadyHandle`] 로 준비 완료를 알린다.
pub struct DeferredCodec<C> {
    inner: C,
    ready_rx: watch::Receiver<bool>,
}

/// 코덱 준비 완료 알림 핸들
#[derive(Debug)]
pub struct CodecReadyHandle {
    ready_tx: watch::Sender<bool>,
}

impl<C: Codec> DeferredCodec<C> {
    pub fn new(inner: C) -> (Self, CodecReadyHandle) {
        let (ready_tx, ready_rx) = watch::channel(false);
        (Self { inner, ready_rx }, CodecReadyHandle { ready_tx })
    }
}

impl CodecReadyHandle {
    /// 코덱 준비 완료 표시
    pub fn mark_ready(&self) {
        self.ready_tx.send_replace(true);
    }
}

impl<C: Codec> Codec for DeferredCodec<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    fn ready_signal(&self) -> Option<watch::Receiver<bool>> {
        Some(self.ready_rx.clone())
    }

    fn compress(&self, data: &[u8], level: u8) -> io::Result<Vec<u8>> {
        self.inner.compress(data, level)
    }

    fn decompress(&self, data: &[u8], max_len: usize) -> io::Result<Vec<u8>> {
        self.inner.decompress(data, max_len)
    }
}

/// 압축/해제 결과
#[derive(Debug, Clone)]
pub struct CodecOutput {
    pub data: Bytes,
    pub elapsed: Duration,
    pub input_len: usize,
}

impl CodecOutput {
    /// 출력 크기 - 입력 크기 (압축 시 음수면 절약)
    pub fn size_delta(&self) -> i64 {
        self.data.len() as i64 - self.input_len as i64
    }
}

/// 코덱 어댑터
#[derive(Clone)]
pub struct CompressionAdapter {
    codec: Arc<dyn Codec>,
}

impl std::fmt::Debug for CompressionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionAdapter")
            .field("codec", &self.codec.name())
            .field("ready", &self.codec.is_ready())
            .finish()
    }
}

impl Default for CompressionAdapter {
    fn default() -> Self {
        Self::zstd()
    }
}

impl CompressionAdapter {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }

    pub fn zstd() -> Self {
        Self::new(Arc::new(ZstdCodec))
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn is_ready(&self) -> bool {
        self.codec.is_ready()
    }

    /// 코덱 준비 완료까지 대기
    ///
    /// 준비 신호를 보내는 쪽이 먼저 사라지면 `CodecUnavailable`.
    pub async fn wait_ready(&self) -> Result<()> {
        let Some(mut signal) = self.codec.ready_signal() else {
            return Ok(());
        };
        signal
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| Error::CodecUnavailable)
    }

    /// 청크 압축
    pub fn compress(&self, data: &[u8], level: u8) -> Result<CodecOutput> {
        if !self.codec.is_ready() {
            return Err(Error::CodecUnavailable);
        }

        let started = Instant::now();
        let out = self
            .codec
            .compress(data, level)
            .map_err(|e| Error::Codec(format!("{} compress: {}", self.codec.name(), e)))?;

        Ok(CodecOutput {
            data: Bytes::from(out),
            elapsed: started.elapsed(),
            input_len: data.len(),
        })
    }

    /// 청크 해제
    ///
    /// 출력은 `max_len` 바이트로 제한되며 넘으면 `Codec` 에러.
    pub fn decompress(&self, data: &[u8], max_len: usize) -> Result<CodecOutput> {
        if !self.codec.is_ready() {
            return Err(Error::CodecUnavailable);
        }

        let started = Instant::now();
        let out = self
            .codec
            .decompress(data, max_len)
            .map_err(|e| Error::Codec(format!("{} decompress: {}", self.codec.name(), e)))?;

        // 주입된 코덱이 제한을 무시한 경우
        if out.len() > max_len {
            return Err(Error::Codec(format!(
                "{} decompress: 출력 {} bytes 가 제한 {} bytes 초과",
                self.codec.name(),
                out.len(),
                max_len
            )));
        }

        Ok(CodecOutput {
            data: Bytes::from(out),
            elapsed: started.elapsed(),
            input_len: data.len(),
        })
    }

    /// 여러 청크를 워커 풀에서 병렬 압축
    ///
    /// 결과 순서는 입력 순서와 같다.
    pub fn compress_batch(
        &self,
        pool: &rayon::ThreadPool,
        chunks: &[Bytes],
        level: u8,
    ) -> Vec<Result<CodecOutput>> {
        pool.install(|| {
            chunks
                .par_iter()
                .map(|chunk| self.compress(chunk, level))
                .collect()
        })
    }
}
