//! 에러 타입 정의

use thiserror::Error;

/// DCXFER 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("채널이 열려 있지 않음")]
    ChannelNotReady,

    #[error("채널 종료")]
    ChannelClosed,

    #[error("압축 코덱 준비 안 됨")]
    CodecUnavailable,

    #[error("코덱 에러: {0}")]
    Codec(String),

    #[error("체크섬 불일치: index={index}, expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { index: u32, expected: u32, got: u32 },

    #[error("프로토콜 위반: state={state}, frame={frame}")]
    ProtocolViolation { state: String, frame: String },

    #[error("크기 불일치: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("drain 타임아웃: buffered={buffered}, threshold={threshold}")]
    DrainTimeout { buffered: usize, threshold: usize },

    #[error("유효하지 않은 프레임: {0}")]
    InvalidFrame(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("전송 취소됨")]
    Cancelled,

    #[error("전달 실패: {0}")]
    Delivery(String),
}

impl Error {
    pub(crate) fn violation(state: impl std::fmt::Display, frame: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            state: state.to_string(),
            frame: frame.into(),
        }
    }

    /// 전송을 계속 진행할 수 있는 에러인지 여부
    ///
    /// 수신측은 이 에러들을 로그로 남기고 다음 프레임을 처리한다.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Codec(_)
                | Error::ChecksumMismatch { .. }
                | Error::ProtocolViolation { .. }
                | Error::SizeMismatch { .. }
                | Error::InvalidFrame(_)
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
