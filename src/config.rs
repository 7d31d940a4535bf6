//! 프로토콜 설정

use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_BUFFER_THRESHOLD, DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL,
    MAX_CHUNK_SIZE,
};

/// DCXFER 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 백프레셔 임계값 (바이트)
    /// 채널 송신 큐가 이 값을 넘으면 drain 될 때까지 송신 중단
    pub buffer_threshold: usize,

    /// 청크별 압축 활성화
    pub compression_enabled: bool,

    /// zstd 압축 레벨 (compression_enabled 일 때만 의미 있음)
    pub compression_level: u8,

    /// drain 폴링 간격 (밀리초)
    /// 채널이 low-watermark 알림을 지원하지 않을 때만 사용
    pub drain_poll_interval_ms: u64,

    /// drain 대기 타임아웃 (밀리초)
    /// 0이면 무한 대기
    pub drain_timeout_ms: u64,

    /// 병렬 압축 워커 수
    /// 1이면 인라인 압축, 그 이상이면 해당 개수만큼 묶어서 병렬 압축
    pub parallel_workers: usize,

    /// 바이너리 프레임 앞에 청크 인덱스(4바이트 LE) 부착
    pub indexed_binary_frames: bool,

    /// 청크 헤더에 CRC32 체크섬 포함
    pub chunk_checksums: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            compression_enabled: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            drain_poll_interval_ms: 5,
            drain_timeout_ms: 0,              // 무한 대기
            parallel_workers: 1,              // 인라인
            indexed_binary_frames: false,
            chunk_checksums: true,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 압축 활성화
    pub fn with_compression(mut self, level: u8) -> Self {
        self.compression_enabled = true;
        self.compression_level = level;
        self
    }

    /// 페이로드 길이에 대한 청크 수 계산
    pub fn chunks_for(&self, len: usize) -> usize {
        crate::chunk::chunk_count(len, self.chunk_size)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        if self.drain_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.drain_timeout_ms))
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0보다 커야 함".into()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} 가 최대값 {} 를 초과",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.buffer_threshold == 0 {
            return Err(Error::InvalidConfig("buffer_threshold는 0보다 커야 함".into()));
        }
        if self.compression_enabled {
            let max_level = *zstd::compression_level_range().end();
            if self.compression_level == 0 || i32::from(self.compression_level) > max_level {
                return Err(Error::InvalidConfig(format!(
                    "compression_level {} 는 1..={} 범위여야 함",
                    self.compression_level, max_level
                )));
            }
        }
        Ok(())
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            chunk_size: 16 * 1024,            // 16KB
            buffer_threshold: 256 * 1024,     // 256KB
            compression_enabled: false,
            compression_level: 1,
            drain_poll_interval_ms: 10,
            drain_timeout_ms: 0,
            parallel_workers: 1,
            indexed_binary_frames: false,
            chunk_checksums: true,
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            chunk_size: 256 * 1024,           // 256KB
            buffer_threshold: 8 * 1024 * 1024, // 8MB
            compression_enabled: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            drain_poll_interval_ms: 1,
            drain_timeout_ms: 0,
            parallel_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            indexed_binary_frames: false,
            chunk_checksums: true,
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            chunk_size: 16 * 1024,            // 작은 청크
            buffer_threshold: 512 * 1024,
            compression_enabled: true,
            compression_level: 6,
            drain_poll_interval_ms: 20,
            drain_timeout_ms: 30_000,         // 30초
            parallel_workers: 1,
            indexed_binary_frames: true,      // 위치 기반 페어링 강화
            chunk_checksums: true,
        }
    }
}
