//! 수신자
//!
//! - 프레임 도착 순서대로 처리 (재정렬 없음)
//! - 헤더 → 바이너리 쌍으로 청크 복원, 필요 시 해제
//! - 완료 프레임에서 조립 후 전달
//!
//! ```text
//! Idle ──metadata──▶ AwaitingChunk ──chunk──▶ HaveHeader
//!  ▲                   │   ▲                    │
//!  └────complete───────┘   └──────binary────────┘
//! ```
//!
//! 상태에 맞지 않는 프레임은 `ProtocolViolation` 으로 보고하고 무시한다.
//! 해제 실패나 체크섬 불일치는 해당 청크만 버리고 계속 진행한다.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::Frame;
use crate::chunk::ChunkIndex;
use crate::compression::CompressionAdapter;
use crate::message::{self, ChunkHeader, ControlMessage, TransferMetadata};
use crate::stats::{ProgressCallback, TransferBenchmark, TransferProgress};
use crate::{Error, Result, MAX_CHUNK_SIZE};

/// 완료된 전송 채널 수신기 타입
pub type CompletedReceiver = mpsc::Receiver<CompletedTransfer>;

/// 읽히지 않은 완료 통지 최대 개수
const COMPLETED_QUEUE_LEN: usize = 16;

/// 수신 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    AwaitingChunk,
    HaveHeader,
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReceiverState::Idle => "Idle",
            ReceiverState::AwaitingChunk => "AwaitingChunk",
            ReceiverState::HaveHeader => "HaveHeader",
        };
        f.write_str(name)
    }
}

/// 진행 중인 수신 전송
#[derive(Debug)]
pub struct TransferSession {
    /// 송신측 메타데이터
    pub metadata: TransferMetadata,

    /// 페이로드를 기다리는 헤더
    pending_header: Option<ChunkHeader>,

    /// 해제된 청크들 (도착 순서)
    accumulated: Vec<Bytes>,

    received_bytes: u64,

    received_chunks: u32,

    /// 다음에 기대하는 청크 인덱스
    next_index: ChunkIndex,

    stats: TransferBenchmark,
}

impl TransferSession {
    fn new(metadata: TransferMetadata) -> Self {
        Self {
            accumulated: Vec::new(),
            metadata,
            pending_header: None,
            received_bytes: 0,
            received_chunks: 0,
            next_index: 0,
            stats: TransferBenchmark::new(),
        }
    }

    pub fn pending_header(&self) -> Option<&ChunkHeader> {
        self.pending_header.as_ref()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks
    }

    pub fn stats(&self) -> &TransferBenchmark {
        &self.stats
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            chunks_done: self.received_chunks,
            total_chunks: self.metadata.total_chunks,
            bytes_done: self.received_bytes,
            total_bytes: self.metadata.total_size,
        }
    }

    /// 누적 청크를 하나의 버퍼로 연결
    fn assemble(&mut self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.received_bytes as usize);
        for chunk in self.accumulated.drain(..) {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    }
}

/// 조립이 끝난 전송
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub metadata: TransferMetadata,
    pub data: Bytes,
    pub received_chunks: u32,
    pub benchmark: TransferBenchmark,

    /// 전달 실패 시 에러 메시지
    pub delivery_error: Option<String>,
}

impl CompletedTransfer {
    /// 조립 크기가 선언 크기와 같은지 확인
    pub fn verify_size(&self) -> Result<()> {
        let got = self.data.len() as u64;
        if got == self.metadata.total_size {
            Ok(())
        } else {
            Err(Error::SizeMismatch {
                expected: self.metadata.total_size,
                got,
            })
        }
    }

    pub fn is_intact(&self) -> bool {
        self.verify_size().is_ok() && self.benchmark.anomalies() == 0
    }
}

/// 완료된 페이로드를 호스트 환경으로 넘기는 전달 대상
///
/// 수신 태스크 안에서 동기적으로 호출되므로 오래 걸리는 작업은
/// [`run_blocking`] 으로 감싸거나 다른 태스크로 넘겨야 한다.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, name: &str, mime_hint: &str, data: &Bytes) -> Result<()>;
}

/// 메모리에 전달 결과를 모아두는 sink
#[derive(Debug, Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<Delivery>>,
}

/// 전달 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub name: String,
    pub mime_hint: String,
    pub data: Bytes,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 지금까지 전달된 항목 꺼내기
    pub fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }
}

impl DeliverySink for MemorySink {
    fn deliver(&self, name: &str, mime_hint: &str, data: &Bytes) -> Result<()> {
        self.deliveries.lock().push(Delivery {
            name: name.to_string(),
            mime_hint: mime_hint.to_string(),
            data: data.clone(),
        });
        Ok(())
    }
}

/// 디렉터리에 파일로 저장하는 sink
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 저장 경로 (이름에서 디렉터리 성분 제거)
    pub fn target_path(&self, name: &str) -> PathBuf {
        self.dir.join(sanitize_file_name(name))
    }
}

impl DeliverySink for DirectorySink {
    fn deliver(&self, name: &str, _mime_hint: &str, data: &Bytes) -> Result<()> {
        let path = self.target_path(name);
        run_blocking(|| std::fs::create_dir_all(&self.dir).and_then(|_| std::fs::write(&path, data)))
            .map_err(|e| Error::Delivery(format!("{:?}: {}", path, e)))?;
        info!("저장 완료: {:?} ({} bytes)", path, data.len());
        Ok(())
    }
}

/// 블로킹 작업 실행
///
/// 멀티 스레드 런타임에서는 `block_in_place` 로 워커를 비워주고,
/// 그 외(current_thread, 런타임 밖)에서는 그대로 실행한다.
pub fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "download.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 수신 상태 머신
///
/// 한 번에 하나의 수신 전송만 유지한다. 프레임 하나는 다음 프레임 전에 완전히 처리된다.
pub struct Receiver {
    /// 해제 어댑터
    decompressor: CompressionAdapter,

    /// 활성 전송
    session: Option<TransferSession>,

    /// 전달 대상
    sink: Option<Arc<dyn DeliverySink>>,

    /// 마지막으로 끝난 전송의 통계
    last_stats: TransferBenchmark,

    /// 활성 전송 없이 들어온 위반 프레임 수
    idle_violations: u64,

    /// 허용하는 청크 원본 크기 상한
    max_chunk_size: usize,

    progress: Option<ProgressCallback>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            decompressor: CompressionAdapter::zstd(),
            session: None,
            sink: None,
            last_stats: TransferBenchmark::new(),
            idle_violations: 0,
            max_chunk_size: MAX_CHUNK_SIZE,
            progress: None,
        }
    }

    pub fn with_decompressor(mut self, decompressor: CompressionAdapter) -> Self {
        self.decompressor = decompressor;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DeliverySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 청크 원본 크기 상한 설정 (헤더 거부 및 해제 출력 제한에 사용)
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    /// 진행률 콜백 등록
    pub fn on_progress(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    pub fn state(&self) -> ReceiverState {
        match &self.session {
            None => ReceiverState::Idle,
            Some(session) if session.pending_header.is_some() => ReceiverState::HaveHeader,
            Some(_) => ReceiverState::AwaitingChunk,
        }
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// 활성 전송이 있으면 그 통계, 없으면 마지막 전송 통계
    pub fn stats(&self) -> TransferBenchmark {
        match &self.session {
            Some(session) => session.stats.clone(),
            None => self.last_stats.clone(),
        }
    }

    pub fn idle_violations(&self) -> u64 {
        self.idle_violations
    }

    /// 로컬 취소 (채널은 그대로 둔다)
    pub fn cancel(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stats.finish();
            info!(
                "수신 취소: name={}, {}/{} chunks",
                session.metadata.name, session.received_chunks, session.metadata.total_chunks
            );
            self.last_stats = session.stats;
        }
    }

    /// 프레임 하나 처리
    ///
    /// 완료 프레임을 처리하면 조립된 전송을 반환한다. 반환된 에러가
    /// [`Error::is_recoverable`] 이면 상태는 일관되게 유지되며 다음 프레임을 계속 처리하면 된다.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Option<CompletedTransfer>> {
        match frame {
            Frame::Text(text) => {
                let msg = match ControlMessage::decode(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        self.count_violation();
                        warn!("제어 프레임 파싱 실패 (state={}): {}", self.state(), e);
                        return Err(e);
                    }
                };
                self.handle_control(msg)
            }
            Frame::Binary(data) => {
                self.handle_binary(data)?;
                Ok(None)
            }
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<Option<CompletedTransfer>> {
        match (self.state(), msg) {
            (ReceiverState::Idle, ControlMessage::Metadata(metadata)) => {
                self.start_transfer(metadata)?;
                Ok(None)
            }
            (ReceiverState::AwaitingChunk, ControlMessage::Chunk(header)) => {
                if header.original_size as usize > self.max_chunk_size {
                    let frame = format!(
                        "chunk(index={}, originalSize={} > {})",
                        header.index, header.original_size, self.max_chunk_size
                    );
                    return Err(self.violation(ReceiverState::AwaitingChunk, &frame));
                }
                self.accept_header(header);
                Ok(None)
            }
            (ReceiverState::AwaitingChunk, ControlMessage::Complete) => self.finalize().map(Some),
            (_, ControlMessage::Cancel { reason }) => {
                info!("송신측 취소 수신: {}", reason);
                self.cancel();
                Ok(None)
            }
            (state, msg) => Err(self.violation(state, msg.kind())),
        }
    }

    fn start_transfer(&mut self, metadata: TransferMetadata) -> Result<()> {
        if metadata.compressed && !self.decompressor.is_ready() {
            warn!("압축 전송이지만 코덱 준비 안 됨: name={}", metadata.name);
            return Err(Error::CodecUnavailable);
        }

        info!(
            "수신 시작: name={}, size={}, chunks={}, compressed={}",
            metadata.name, metadata.total_size, metadata.total_chunks, metadata.compressed
        );
        self.session = Some(TransferSession::new(metadata));
        Ok(())
    }

    fn accept_header(&mut self, header: ChunkHeader) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if header.index != session.next_index {
            // 재전송 계층이 없으므로 보고만 하고 계속
            session.stats.out_of_order_chunks += 1;
            warn!(
                "청크 순서 이상: expected {}, got {}",
                session.next_index, header.index
            );
        }
        session.next_index = header.index.wrapping_add(1);

        if !session.metadata.compressed && header.wire_size != header.original_size {
            warn!(
                "비압축 전송의 크기 불일치: index={}, original={}, wire={}",
                header.index, header.original_size, header.wire_size
            );
        }

        session.pending_header = Some(header);
    }

    fn handle_binary(&mut self, frame: Bytes) -> Result<()> {
        let state = self.state();
        if state != ReceiverState::HaveHeader {
            return Err(self.violation(state, "binary"));
        }

        let Some(session) = self.session.as_mut() else {
            return Err(Error::violation(state, "binary"));
        };
        let Some(header) = session.pending_header else {
            return Err(Error::violation(state, "binary"));
        };

        let payload = match message::decode_binary(frame, session.metadata.indexed_frames) {
            Ok((Some(index), _)) if index != header.index => {
                session.stats.protocol_violations += 1;
                warn!(
                    "바이너리 프레임 인덱스 불일치: header={}, frame={}",
                    header.index, index
                );
                return Err(Error::violation(
                    state,
                    format!("binary(index={}, expected={})", index, header.index),
                ));
            }
            Ok((_, payload)) => payload,
            Err(e) => {
                session.stats.protocol_violations += 1;
                warn!("바이너리 프레임 해석 실패: {}", e);
                return Err(e);
            }
        };

        // 여기부터 헤더는 소비된다
        session.pending_header = None;

        let wire_len = payload.len();
        if wire_len != header.wire_size as usize {
            warn!(
                "전송 크기 불일치: index={}, header={}, actual={}",
                header.index, header.wire_size, wire_len
            );
        }

        let original = if session.metadata.compressed {
            match self
                .decompressor
                .decompress(&payload, header.original_size as usize)
            {
                Ok(out) => {
                    session.stats.decompression_time += out.elapsed;
                    out.data
                }
                Err(e) => {
                    session.stats.codec_errors += 1;
                    warn!("청크 {} 해제 실패, 버림: {}", header.index, e);
                    return Err(e);
                }
            }
        } else {
            payload
        };

        if let Err(e) = header.verify(&original) {
            session.stats.checksum_failures += 1;
            warn!("청크 {} 체크섬 실패, 버림: {}", header.index, e);
            return Err(e);
        }

        if original.len() != header.original_size as usize {
            warn!(
                "원본 크기 불일치: index={}, header={}, actual={}",
                header.index,
                header.original_size,
                original.len()
            );
        }

        session.received_bytes += original.len() as u64;
        session.received_chunks += 1;
        session.stats.chunks_received += 1;
        session.stats.record_chunk(original.len(), wire_len);
        session.accumulated.push(original);

        debug!(
            "청크 {}/{} 수신: {} bytes",
            header.index.saturating_add(1),
            session.metadata.total_chunks,
            wire_len
        );

        if let Some(callback) = &self.progress {
            callback(session.progress());
        }

        Ok(())
    }

    fn finalize(&mut self) -> Result<CompletedTransfer> {
        let Some(mut session) = self.session.take() else {
            return Err(self.violation(ReceiverState::Idle, "complete"));
        };

        let data = session.assemble();
        session.stats.finish();

        if session.received_chunks != session.metadata.total_chunks {
            warn!(
                "청크 수 불일치: expected {}, got {}",
                session.metadata.total_chunks, session.received_chunks
            );
        }

        let mut completed = CompletedTransfer {
            metadata: session.metadata,
            data,
            received_chunks: session.received_chunks,
            benchmark: session.stats,
            delivery_error: None,
        };

        // 크기가 달라도 조립된 만큼 전달한다
        if let Err(e) = completed.verify_size() {
            warn!("{}: name={}", e, completed.metadata.name);
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.deliver(
                &completed.metadata.name,
                &completed.metadata.mime_hint,
                &completed.data,
            ) {
                warn!("전달 실패: name={}, error={}", completed.metadata.name, e);
                completed.delivery_error = Some(e.to_string());
            }
        }

        info!(
            "수신 완료: name={}, {}",
            completed.metadata.name,
            completed.benchmark.summary()
        );
        self.last_stats = completed.benchmark.clone();
        Ok(completed)
    }

    fn count_violation(&mut self) {
        match self.session.as_mut() {
            Some(session) => session.stats.protocol_violations += 1,
            None => self.idle_violations += 1,
        }
    }

    fn violation(&mut self, state: ReceiverState, frame: &str) -> Error {
        self.count_violation();
        warn!("프로토콜 위반: state={}, frame={} (무시)", state, frame);
        Error::violation(state, frame)
    }

    /// 상태 머신을 전용 태스크로 옮겨 실행
    ///
    /// 완료된 전송은 반환된 채널로도 통지된다. 채널이 읽히지 않아 가득 차면
    /// 통지만 생략되고 sink 전달과 프레임 처리는 계속된다.
    pub fn spawn(self) -> (ReceiverHandle, CompletedReceiver) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ReceiverCmd>(1024);
        let (completed_tx, completed_rx) = mpsc::channel::<CompletedTransfer>(COMPLETED_QUEUE_LEN);

        let stats = Arc::new(RwLock::new(TransferBenchmark::new()));
        let state = Arc::new(RwLock::new(ReceiverState::Idle));
        let running = Arc::new(AtomicBool::new(true));
        let completed_count = Arc::new(AtomicU64::new(0));

        let stats_main = stats.clone();
        let state_main = state.clone();
        let running_main = running.clone();
        let completed_count_main = completed_count.clone();
        let mut receiver = self;

        let task = tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let completed = match cmd {
                    ReceiverCmd::Frame(frame) => match receiver.handle_frame(frame) {
                        Ok(done) => done,
                        Err(e) if e.is_recoverable() => {
                            debug!("프레임 무시 후 계속: {}", e);
                            None
                        }
                        Err(e) => {
                            warn!("프레임 처리 에러: {}", e);
                            None
                        }
                    },
                    ReceiverCmd::Cancel => {
                        receiver.cancel();
                        None
                    }
                    ReceiverCmd::Stop => break,
                };

                // 통계 업데이트 (완료 통지 전에)
                *stats_main.write() = receiver.stats();
                *state_main.write() = receiver.state();

                // 통지 채널이 가득 차도 프레임 처리는 멈추지 않는다
                if let Some(done) = completed {
                    completed_count_main.fetch_add(1, Ordering::Relaxed);
                    match completed_tx.try_send(done) {
                        Ok(()) => {}
                        Err(TrySendError::Full(done)) => {
                            warn!("완료 채널 가득 참, 통지 생략: name={}", done.metadata.name);
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("완료 채널 수신자 없음");
                        }
                    }
                }
            }

            running_main.store(false, Ordering::SeqCst);
            receiver
        });

        let handle = ReceiverHandle {
            cmd_tx,
            stats,
            state,
            running,
            completed_count,
            task,
        };

        (handle, completed_rx)
    }
}

/// 수신 태스크 명령
#[derive(Debug)]
pub enum ReceiverCmd {
    Frame(Frame),
    Cancel,
    Stop,
}

/// 수신 태스크 핸들 (외부에서 제어용)
pub struct ReceiverHandle {
    cmd_tx: mpsc::Sender<ReceiverCmd>,
    stats: Arc<RwLock<TransferBenchmark>>,
    state: Arc<RwLock<ReceiverState>>,
    running: Arc<AtomicBool>,
    completed_count: Arc<AtomicU64>,
    task: JoinHandle<Receiver>,
}

impl ReceiverHandle {
    /// 도착한 프레임 전달
    pub async fn push_frame(&self, frame: Frame) -> Result<()> {
        self.cmd_tx
            .send(ReceiverCmd::Frame(frame))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 진행 중인 수신 취소
    pub async fn cancel(&self) -> Result<()> {
        self.cmd_tx
            .send(ReceiverCmd::Cancel)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 전송 계층의 프레임 스트림을 읽어 상태 머신에 공급하는 태스크 시작
    pub fn attach<S>(&self, mut source: S) -> JoinHandle<()>
    where
        S: Stream<Item = Frame> + Send + Unpin + 'static,
    {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                if cmd_tx.send(ReceiverCmd::Frame(frame)).await.is_err() {
                    break;
                }
            }
        })
    }

    /// 태스크 정지 후 상태 머신 회수
    pub async fn stop(self) -> Result<Receiver> {
        let _ = self.cmd_tx.send(ReceiverCmd::Stop).await;
        self.task
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferBenchmark {
        self.stats.read().clone()
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.read()
    }

    /// 완료된 전송 수
    pub fn completed_transfers(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
