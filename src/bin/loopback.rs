//! DCXFER 루프백 - 메모리 채널 위에서 송신자와 수신자를 함께 실행
//!
//! 실제 전송 계층 없이 청크/압축/백프레셔/조립 파이프라인 전체를 확인한다.
//!
//! 사용법:
//!   cargo run --release --bin dcxfer-loopback -- [OPTIONS]
//!
//! 예시:
//!   # 10MB 랜덤 데이터, 압축 없이
//!   cargo run --release --bin dcxfer-loopback -- --size 10485760
//!
//!   # 파일 전송 + 압축 + 수신 파일 저장
//!   cargo run --release --bin dcxfer-loopback -- -f report.pdf -c --level 6 -o ./received

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::RngCore;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dcxfer::channel::memory_channel;
use dcxfer::receiver::DeliverySink;
use dcxfer::{Config, DirectorySink, MemorySink, Receiver, Sender};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 루프백 설정
struct LoopbackConfig {
    file: Option<PathBuf>,
    size: usize,
    compressible: bool,
    output_dir: Option<PathBuf>,
    config: Config,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            file: None,
            size: 10 * 1024 * 1024, // 10MB
            compressible: false,
            output_dir: None,
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, BoxError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 옵션에 값이 필요함", flag).into())
}

fn parse_args() -> Result<LoopbackConfig, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = LoopbackConfig::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--file" | "-f" => {
                config.file = Some(PathBuf::from(value(&args, i, flag)?));
                i += 1;
            }
            "--size" | "-s" => {
                config.size = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--chunk-size" => {
                config.config.chunk_size = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--compress" | "-c" => {
                config.config.compression_enabled = true;
            }
            "--level" | "-l" => {
                config.config.compression_level = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--threshold" | "-t" => {
                config.config.buffer_threshold = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--workers" | "-w" => {
                config.config.parallel_workers = value(&args, i, flag)?.parse()?;
                i += 1;
            }
            "--indexed" => {
                config.config.indexed_binary_frames = true;
            }
            "--no-checksum" => {
                config.config.chunk_checksums = false;
            }
            "--compressible" => {
                config.compressible = true;
            }
            "--output-dir" | "-o" => {
                config.output_dir = Some(PathBuf::from(value(&args, i, flag)?));
                i += 1;
            }
            "--preset" => {
                config.config = match value(&args, i, flag)? {
                    "low-spec" => Config::low_spec(),
                    "high-performance" => Config::high_performance(),
                    "unstable-network" => Config::unstable_network(),
                    other => return Err(format!("알 수 없는 preset: {}", other).into()),
                };
                i += 1;
            }
            "--help" | "-h" => {
                println!(
                    r#"DCXFER Loopback - 메모리 채널 루프백 전송

사용법:
  cargo run --release --bin dcxfer-loopback -- [OPTIONS]

옵션:
  -f, --file <PATH>         전송할 파일 (없으면 생성 데이터)
  -s, --size <BYTES>        생성 데이터 크기 (기본: 10MB)
  --compressible            랜덤 대신 반복 텍스트 생성
  --chunk-size <BYTES>      청크 크기 (기본: 65536)
  -c, --compress            청크별 zstd 압축
  -l, --level <1-22>        압축 레벨 (기본: 3)
  -t, --threshold <BYTES>   백프레셔 임계값 (기본: 1MB)
  -w, --workers <N>         병렬 압축 워커 수 (기본: 1)
  --indexed                 바이너리 프레임에 청크 인덱스 부착
  --no-checksum             청크 CRC32 생략
  --preset <NAME>           low-spec | high-performance | unstable-network
  -o, --output-dir <DIR>    수신 파일 저장 디렉터리
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG 로 조절 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => {
                warn!("알 수 없는 옵션 무시: {}", other);
            }
        }
        i += 1;
    }

    Ok(config)
}

fn load_payload(config: &LoopbackConfig) -> Result<(String, Bytes), BoxError> {
    if let Some(path) = &config.file {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "payload.bin".to_string());
        return Ok((name, Bytes::from(data)));
    }

    let data: Vec<u8> = if config.compressible {
        b"the quick brown fox jumps over the lazy dog\n"
            .iter()
            .copied()
            .cycle()
            .take(config.size)
            .collect()
    } else {
        let mut data = vec![0u8; config.size];
        rand::thread_rng().fill_bytes(&mut data);
        data
    };
    Ok(("generated.bin".to_string(), Bytes::from(data)))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let loopback = parse_args()?;
    let (name, payload) = load_payload(&loopback)?;
    let config = loopback.config.clone();

    info!("DCXFER Loopback starting...");
    info!(
        "Payload: {} ({} bytes), chunk size: {}, compression: {}",
        name,
        payload.len(),
        config.chunk_size,
        if config.compression_enabled {
            format!("zstd level {}", config.compression_level)
        } else {
            "off".to_string()
        }
    );

    let (tx, rx) = memory_channel();
    let mut sender = Sender::new(config, Arc::new(tx))?;

    let sink: Arc<dyn DeliverySink> = match &loopback.output_dir {
        Some(dir) => Arc::new(DirectorySink::new(dir)),
        None => Arc::new(MemorySink::new()),
    };
    let (handle, mut completed) = Receiver::new().with_sink(sink).spawn();
    let reader = handle.attach(rx);

    let started = Instant::now();
    let sent = sender.send(&name, "application/octet-stream", payload.clone()).await?;
    info!("Sender: {}", sent.summary());

    let done = completed
        .recv()
        .await
        .ok_or("수신 태스크가 완료 전에 종료됨")?;
    let elapsed = started.elapsed();

    info!("Receiver: {}", done.benchmark.summary());
    if let Some(e) = &done.delivery_error {
        warn!("전달 실패: {}", e);
    }

    let intact = done.data == payload;
    info!(
        "Loopback finished in {:.2}s: {} bytes, {:.2} MB/s, intact={}",
        elapsed.as_secs_f64(),
        done.data.len(),
        done.data.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1_000_000.0,
        intact
    );

    drop(sender);
    let _ = reader.await;
    handle.stop().await?;

    if !intact {
        return Err("수신 데이터가 원본과 다름".into());
    }
    Ok(())
}
