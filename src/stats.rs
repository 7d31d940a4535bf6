//! 전송 통계

use std::time::{Duration, Instant};

/// 전송 진행률
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub chunks_done: u32,
    pub total_chunks: u32,
    pub bytes_done: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    /// 진행률 (0.0 ~ 1.0), 빈 전송은 1.0
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_done as f64 / self.total_bytes as f64
    }

    pub fn percent(&self) -> f64 {
        self.ratio() * 100.0
    }
}

/// 진행률 콜백
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// 전송 벤치마크
///
/// 전송 방향마다 시작 시 리셋되고, 완료 후에는 읽기 전용으로 취급한다.
#[derive(Debug, Clone)]
pub struct TransferBenchmark {
    /// 시작 시간
    pub start_time: Instant,

    /// 종료 시간
    pub end_time: Option<Instant>,

    /// 누적 압축 시간
    pub compression_time: Duration,

    /// 누적 해제 시간
    pub decompression_time: Duration,

    /// 원본 바이트 합계
    pub original_bytes: u64,

    /// 전송(wire) 바이트 합계
    pub wire_bytes: u64,

    /// 송신 청크 수
    pub chunks_sent: u64,

    /// 수신 청크 수
    pub chunks_received: u64,

    /// drain 대기 횟수
    pub drain_waits: u64,

    /// 누적 drain 대기 시간
    pub drain_time: Duration,

    /// 해제 실패 청크 수
    pub codec_errors: u64,

    /// 체크섬 불일치 청크 수
    pub checksum_failures: u64,

    /// 상태에 맞지 않는 프레임 수
    pub protocol_violations: u64,

    /// 순서가 어긋난 청크 인덱스 수
    pub out_of_order_chunks: u64,
}

impl Default for TransferBenchmark {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferBenchmark {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            end_time: None,
            compression_time: Duration::ZERO,
            decompression_time: Duration::ZERO,
            original_bytes: 0,
            wire_bytes: 0,
            chunks_sent: 0,
            chunks_received: 0,
            drain_waits: 0,
            drain_time: Duration::ZERO,
            codec_errors: 0,
            checksum_failures: 0,
            protocol_violations: 0,
            out_of_order_chunks: 0,
        }
    }

    /// 통계 리셋
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// 종료 시간 기록
    pub fn finish(&mut self) {
        self.end_time = Some(Instant::now());
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// 청크 하나 기록
    pub fn record_chunk(&mut self, original_len: usize, wire_len: usize) {
        self.original_bytes += original_len as u64;
        self.wire_bytes += wire_len as u64;
    }

    pub fn record_drain(&mut self, waited: Duration) {
        self.drain_waits += 1;
        self.drain_time += waited;
    }

    /// 경과 시간 (종료 전이면 현재까지)
    pub fn elapsed(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// 원본 기준 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.original_bytes as f64 / elapsed
    }

    /// 전송 기준 처리율 (bytes/sec)
    pub fn wire_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.wire_bytes as f64 / elapsed
    }

    /// 압축률 = wire / original (작을수록 좋음)
    pub fn compression_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 1.0;
        }
        self.wire_bytes as f64 / self.original_bytes as f64
    }

    /// 절약 비율 (0.0 ~ 1.0, 압축이 커지면 음수)
    pub fn space_saving(&self) -> f64 {
        1.0 - self.compression_ratio()
    }

    /// 이상 징후 총합
    pub fn anomalies(&self) -> u64 {
        self.codec_errors + self.checksum_failures + self.protocol_violations + self.out_of_order_chunks
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Chunks: {} sent / {} recv | Bytes: {} -> {} ({:.1}% saved) | Throughput: {:.2} MB/s | Compress: {:.1}ms | Decompress: {:.1}ms | Drains: {} | Anomalies: {}",
            self.elapsed().as_secs_f64(),
            self.chunks_sent,
            self.chunks_received,
            self.original_bytes,
            self.wire_bytes,
            self.space_saving() * 100.0,
            self.throughput() / 1_000_000.0,
            self.compression_time.as_secs_f64() * 1000.0,
            self.decompression_time.as_secs_f64() * 1000.0,
            self.drain_waits,
            self.anomalies(),
        )
    }
}
