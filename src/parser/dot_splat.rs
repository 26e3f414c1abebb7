use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{ParseError, ParseResult};
use crate::splat::RECORD_SIZE;

/// Streams a `.splat` file as runs of whole 32-byte records, ready to hand
/// to the store's chunked raw path without decoding on this side.
pub struct SplatChunks {
    path: PathBuf,
    reader: BufReader<File>,
    point_count: u32,
    remaining: u32,
    chunk_points: u32,
}

impl SplatChunks {
    pub fn open(path: &Path, chunk_points: u32) -> ParseResult<Self> {
        let io_err = |source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        if len % RECORD_SIZE as u64 != 0 {
            return Err(ParseError::Splat(format!(
                "size {len} is not a multiple of {RECORD_SIZE} bytes ({} complete records)",
                len / RECORD_SIZE as u64
            )));
        }
        if len == 0 {
            return Err(ParseError::Splat("file is empty".to_string()));
        }
        let point_count = u32::try_from(len / RECORD_SIZE as u64)
            .map_err(|_| ParseError::Splat(format!("{len} bytes is too many records")))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::with_capacity(1 << 20, file),
            point_count,
            remaining: point_count,
            chunk_points: chunk_points.max(1),
        })
    }

    pub fn point_count(&self) -> u32 {
        self.point_count
    }

    /// Index of the first record the next chunk will hold.
    pub fn next_point(&self) -> u32 {
        self.point_count - self.remaining
    }

    /// Repositions the stream so the next chunk starts at `point`.
    pub fn seek_to(&mut self, point: u32) -> ParseResult<()> {
        let point = point.min(self.point_count);
        self.reader
            .seek(SeekFrom::Start(point as u64 * RECORD_SIZE as u64))
            .map_err(|source| ParseError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.remaining = self.point_count - point;
        Ok(())
    }
}

impl Iterator for SplatChunks {
    type Item = ParseResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let points = self.remaining.min(self.chunk_points);
        let mut buf = vec![0_u8; points as usize * RECORD_SIZE];
        if let Err(source) = self.reader.read_exact(&mut buf) {
            self.remaining = 0;
            return Some(Err(ParseError::Io {
                path: self.path.clone(),
                source,
            }));
        }
        self.remaining -= points;
        Some(Ok(buf))
    }
}

/// Reads a whole `.splat` file in one buffer.
pub fn read_splat_file(path: &Path) -> ParseResult<Vec<u8>> {
    let chunks = SplatChunks::open(path, u32::MAX)?;
    let mut out = Vec::with_capacity(chunks.point_count() as usize * RECORD_SIZE);
    for chunk in chunks {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::math::Vec3;
    use crate::splat::{decode_record, encode_records, Splat};

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".splat")
            .tempfile()
            .expect("temp file");
        file.write_all(bytes).expect("write");
        file.flush().expect("flush");
        file
    }

    #[test]
    fn streams_whole_records() {
        let splats: Vec<Splat> = (0..5)
            .map(|i| Splat {
                position: Vec3::new(i as f32, 0.0, 0.0),
                color: [1, 2, 3],
                opacity: 1.0,
                scale: Vec3::new(0.1, 0.1, 0.1),
                rotation: [1.0, 0.0, 0.0, 0.0],
            })
            .collect();
        let file = write_temp(&encode_records(&splats));
        let chunks = SplatChunks::open(file.path(), 2).unwrap();
        assert_eq!(chunks.point_count(), 5);
        let sizes: Vec<usize> = chunks.map(|c| c.unwrap().len() / RECORD_SIZE).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let whole = read_splat_file(file.path()).unwrap();
        assert_eq!(decode_record(&whole[4 * RECORD_SIZE..]).position.x, 4.0);
    }

    #[test]
    fn seeking_back_replays_records() {
        let splats: Vec<Splat> = (0..4)
            .map(|i| Splat {
                position: Vec3::new(0.0, i as f32, 0.0),
                color: [9, 9, 9],
                opacity: 0.5,
                scale: Vec3::new(0.1, 0.1, 0.1),
                rotation: [1.0, 0.0, 0.0, 0.0],
            })
            .collect();
        let file = write_temp(&encode_records(&splats));
        let mut chunks = SplatChunks::open(file.path(), 3).unwrap();
        chunks.next().unwrap().unwrap();
        assert_eq!(chunks.next_point(), 3);

        chunks.seek_to(1).unwrap();
        assert_eq!(chunks.next_point(), 1);
        let replay = chunks.next().unwrap().unwrap();
        assert_eq!(replay.len(), 3 * RECORD_SIZE);
        assert_eq!(decode_record(&replay).position.y, 1.0);
        assert!(chunks.next().is_none());
    }

    #[test]
    fn rejects_partial_records() {
        let file = write_temp(&[0_u8; 40]);
        assert!(matches!(
            SplatChunks::open(file.path(), 8),
            Err(ParseError::Splat(_))
        ));
        let empty = write_temp(&[]);
        assert!(matches!(
            SplatChunks::open(empty.path(), 8),
            Err(ParseError::Splat(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SplatChunks::open(&dir.path().join("absent.splat"), 1).err().unwrap();
        assert!(matches!(err, ParseError::Io { .. }));
    }
}
