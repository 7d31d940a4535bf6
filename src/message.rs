//! 프로토콜 메시지 정의
//!
//! 제어 메시지(Metadata, ChunkHeader, Complete)는 `type` 태그가 붙은 JSON 텍스트 프레임,
//! 청크 페이로드는 바이너리 프레임으로 전송된다.
//!
//! ```text
//! {"type":"metadata","name":..,"size":..,"mimeType":..,"compressed":..,"compressionLevel":..,"totalChunks":..}
//! {"type":"chunk","index":..,"originalSize":..,"compressedSize":..}
//! <binary payload>
//! {"type":"complete"}
//! ```
//!
//! 바이너리 프레임은 자기 기술 헤더가 없고 바로 앞의 ChunkHeader 와 위치로 짝지어진다.
//! `indexedFrames` 가 켜진 전송에서는 청크 인덱스(u32 LE)가 앞에 붙는다.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkIndex;
use crate::{Error, Result};

/// 인덱스 접두사 크기 (바이트)
pub const INDEX_PREFIX_LEN: usize = 4;

fn is_false(value: &bool) -> bool {
    !*value
}

/// 전송 메타데이터 (전송당 한 번, 첫 청크보다 먼저)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    /// 파일 이름
    pub name: String,

    /// 전체 크기 (바이트)
    #[serde(rename = "size")]
    pub total_size: u64,

    /// MIME 타입 (참고용)
    #[serde(rename = "mimeType")]
    pub mime_hint: String,

    /// 청크별 압축 여부
    pub compressed: bool,

    /// 압축 레벨 (compressed 일 때만 의미 있음)
    pub compression_level: u8,

    /// 총 청크 수 = ceil(total_size / chunk_size)
    pub total_chunks: u32,

    /// 바이너리 프레임에 인덱스 접두사 사용 여부
    #[serde(default, skip_serializing_if = "is_false")]
    pub indexed_frames: bool,
}

/// 청크 헤더 (바이너리 페이로드 직전에 전송)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    /// 청크 인덱스 (0부터, 1씩 증가)
    pub index: ChunkIndex,

    /// 압축 전 크기
    pub original_size: u32,

    /// 전송 크기 (비압축 전송이면 original_size 와 같음)
    #[serde(rename = "compressedSize")]
    pub wire_size: u32,

    /// 원본 청크의 CRC32
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
}

impl ChunkHeader {
    /// 원본 청크 기준 CRC32 검증 (체크섬이 없으면 통과)
    pub fn verify(&self, original: &[u8]) -> Result<()> {
        match self.checksum {
            Some(expected) => {
                let got = crc32fast::hash(original);
                if got == expected {
                    Ok(())
                } else {
                    Err(Error::ChecksumMismatch {
                        index: self.index,
                        expected,
                        got,
                    })
                }
            }
            None => Ok(()),
        }
    }
}

/// 제어 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Metadata(TransferMetadata),
    Chunk(ChunkHeader),
    Complete,
    /// 송신측 취소
    Cancel { reason: String },
}

impl ControlMessage {
    /// 메시지 종류 (로그용)
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Metadata(_) => "metadata",
            ControlMessage::Chunk(_) => "chunk",
            ControlMessage::Complete => "complete",
            ControlMessage::Cancel { .. } => "cancel",
        }
    }

    /// 텍스트 프레임으로 직렬화
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 텍스트 프레임에서 역직렬화
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidFrame(format!("제어 메시지 파싱 실패: {}", e)))
    }
}

pub fn encode_metadata(metadata: &TransferMetadata) -> Result<String> {
    ControlMessage::Metadata(metadata.clone()).encode()
}

pub fn encode_chunk_header(header: &ChunkHeader) -> Result<String> {
    ControlMessage::Chunk(*header).encode()
}

pub fn encode_completion() -> Result<String> {
    ControlMessage::Complete.encode()
}

pub fn encode_cancel(reason: &str) -> Result<String> {
    ControlMessage::Cancel {
        reason: reason.to_string(),
    }
    .encode()
}

/// 바이너리 프레임 생성
pub fn encode_binary(index: ChunkIndex, payload: Bytes, indexed: bool) -> Bytes {
    if !indexed {
        return payload;
    }

    let mut buf = BytesMut::with_capacity(INDEX_PREFIX_LEN + payload.len());
    buf.put_u32_le(index);
    buf.put_slice(&payload);
    buf.freeze()
}

/// 바이너리 프레임 해석
///
/// indexed 가 아니면 인덱스는 `None` 이고 프레임 전체가 페이로드다.
pub fn decode_binary(mut frame: Bytes, indexed: bool) -> Result<(Option<ChunkIndex>, Bytes)> {
    if !indexed {
        return Ok((None, frame));
    }

    if frame.len() < INDEX_PREFIX_LEN {
        return Err(Error::InvalidFrame(format!(
            "인덱스 접두사 부족: {} bytes",
            frame.len()
        )));
    }

    let index = frame.get_u32_le();
    Ok((Some(index), frame))
}
