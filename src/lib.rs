//! # DCXFER (Data Channel Transfer)
//!
//! 순서가 보장되는 메시지 기반 양방향 채널(WebRTC DataChannel 등) 위의
//! 스트리밍 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **고정 크기 청크**: 임의 크기 페이로드를 청크 단위로 분할
//! - **청크별 독립 압축**: 청크마다 별도 zstd 프레임 (스트림 상태 공유 없음)
//! - **헤더 + 바이너리 쌍**: 텍스트 제어 프레임 뒤에 바이너리 페이로드
//! - **백프레셔**: 송신 큐 깊이를 관찰하여 임계값 초과 시 drain 대기
//! - **수신 상태 머신**: 프레임 도착 순서대로 조립, 무결성 검사
//!
//! ```text
//! Sender:   Metadata → (ChunkHeader, Binary)* → Complete
//! Receiver: Idle → AwaitingChunk ⇄ HaveHeader → Idle
//! ```

pub mod backpressure;
pub mod channel;
pub mod chunk;
pub mod compression;
pub mod config;
pub mod error;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod stats;

pub use backpressure::BackpressureGovernor;
pub use channel::{memory_channel, memory_channel_polled, DataChannel, Frame, MemoryChannel, MemoryReceiver};
pub use chunk::{chunk_count, ChunkIndex, Chunker};
pub use compression::{Codec, CodecReadyHandle, CompressionAdapter, DeferredCodec, ZstdCodec};
pub use config::Config;
pub use error::{Error, Result};
pub use message::{ChunkHeader, ControlMessage, TransferMetadata};
pub use receiver::{
    CompletedTransfer, Delivery, DeliverySink, DirectorySink, MemorySink, Receiver, ReceiverHandle,
    ReceiverState,
};
pub use sender::{Sender, SenderState};
pub use stats::{TransferBenchmark, TransferProgress};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 65536; // 64KB

/// 기본 백프레셔 임계값 (바이트)
pub const DEFAULT_BUFFER_THRESHOLD: usize = 1024 * 1024; // 1MB

/// 기본 zstd 압축 레벨
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 3;

/// 청크 하나의 최대 원본 크기 (바이트)
///
/// 수신측은 이보다 큰 청크 헤더를 거부하고, 해제 출력도 헤더 크기로 제한한다.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024; // 16MB
