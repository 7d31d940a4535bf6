//! 청크 분할
//!
//! 페이로드를 고정 크기 슬라이스 `[0,C), [C,2C), …` 로 나눈다.
//! 마지막 슬라이스만 나머지 길이로 잘린다. `Bytes::slice` 를 쓰므로 복사가 없다.

use bytes::Bytes;

use crate::DEFAULT_CHUNK_SIZE;

/// 청크 인덱스 (0부터 시작, 1씩 증가)
pub type ChunkIndex = u32;

/// `ceil(len / chunk_size)` 계산
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    len / chunk_size + usize::from(len % chunk_size != 0)
}

/// 청크 분할기 (송신측)
#[derive(Debug, Clone)]
pub struct Chunker {
    data: Bytes,
    chunk_size: usize,
}

impl Chunker {
    /// `chunk_size` 가 0이면 [`DEFAULT_CHUNK_SIZE`] 사용
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self { data, chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 전체 페이로드 크기
    pub fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// 총 청크 수
    pub fn total_chunks(&self) -> usize {
        chunk_count(self.data.len(), self.chunk_size)
    }

    /// 마지막 청크 길이 (청크가 없으면 0)
    pub fn last_chunk_len(&self) -> usize {
        match self.data.len() % self.chunk_size {
            0 if self.data.is_empty() => 0,
            0 => self.chunk_size,
            rem => rem,
        }
    }

    /// 청크 순회 (다시 호출하면 처음부터 재시작)
    pub fn iter(&self) -> Chunks<'_> {
        Chunks {
            chunker: self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a Chunker {
    type Item = (ChunkIndex, Bytes);
    type IntoIter = Chunks<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 지연 평가되는 청크 시퀀스
#[derive(Debug)]
pub struct Chunks<'a> {
    chunker: &'a Chunker,
    next: usize,
}

impl Iterator for Chunks<'_> {
    type Item = (ChunkIndex, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.chunker.data.len();
        let start = self.next.checked_mul(self.chunker.chunk_size)?;
        if start >= len {
            return None;
        }

        let end = (start + self.chunker.chunk_size).min(len);
        let index = self.next as ChunkIndex;
        self.next += 1;

        Some((index, self.chunker.data.slice(start..end)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.chunker.total_chunks().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks<'_> {}
