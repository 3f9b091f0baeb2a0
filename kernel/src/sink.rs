//! Task-private partial outputs
//!
//! Every worker writes through its own [`PartialSink`]; nothing is shared
//! between sinks. Sealing a sink yields a [`PartialOutput`] carrying the
//! record count and a SHA-256 digest of the encoded records, both checked
//! again before the merger consumes it.
//!
//! Record encoding (20 bytes, little-endian): `[u64 row][u64 col][f32 value]`

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{PairwiseError, Result};
use crate::planner::SubRange;

pub const RECORD_LEN: usize = 20;

/// Records read back per batch when streaming a partial file.
const READ_BATCH: usize = 4096;

/// One evaluated pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairRecord {
    pub row: usize,
    pub col: usize,
    pub value: f32,
}

impl PairRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        LittleEndian::write_u64(&mut buf[..8], self.row as u64);
        LittleEndian::write_u64(&mut buf[8..16], self.col as u64);
        LittleEndian::write_f32(&mut buf[16..], self.value);
        buf
    }

    pub fn decode(buf: &[u8; RECORD_LEN]) -> Self {
        Self {
            row: LittleEndian::read_u64(&buf[..8]) as usize,
            col: LittleEndian::read_u64(&buf[8..16]) as usize,
            value: LittleEndian::read_f32(&buf[16..]),
        }
    }

    /// Read one encoded record from a stream.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            row: reader.read_u64::<LittleEndian>()? as usize,
            col: reader.read_u64::<LittleEndian>()? as usize,
            value: reader.read_f32::<LittleEndian>()?,
        })
    }

    pub fn key(&self) -> (usize, usize) {
        (self.row, self.col)
    }
}

/// Append-only, single-owner output of one worker task.
pub trait PartialSink: Send {
    fn append(&mut self, records: &[PairRecord]) -> Result<()>;

    /// Seal the sink. No appends are possible afterwards.
    fn finish(self: Box<Self>) -> Result<PartialOutput>;

    /// Drop everything written so far.
    fn abort(self: Box<Self>);
}

/// Creates one independent sink per sub-range.
pub trait SinkFactory: Send + Sync {
    fn open(&self, range: &SubRange) -> Result<Box<dyn PartialSink>>;
}

#[derive(Debug)]
enum PartialSource {
    Memory(Vec<PairRecord>),
    File(PathBuf),
}

/// A sealed partial result. Consumed exactly once by the merger.
#[derive(Debug)]
pub struct PartialOutput {
    range: SubRange,
    records: u64,
    digest: [u8; 32],
    source: PartialSource,
}

impl PartialOutput {
    pub fn range(&self) -> &SubRange {
        &self.range
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            PartialSource::File(path) => Some(path),
            PartialSource::Memory(_) => None,
        }
    }

    /// Re-derive count and digest from the stored records.
    pub fn verify(&self) -> Result<()> {
        let mut hasher = Sha256::new();
        let mut count = 0u64;
        self.replay(|batch| {
            for record in batch {
                hasher.update(record.encode());
            }
            count += batch.len() as u64;
            Ok(())
        })?;
        let digest: [u8; 32] = hasher.finalize().into();
        if count != self.records {
            return Err(self.corrupt(format!(
                "expected {} records, found {}",
                self.records, count
            )));
        }
        if digest != self.digest {
            return Err(self.corrupt(format!(
                "digest mismatch (sealed {}, found {})",
                self.digest_hex(),
                hex::encode(digest)
            )));
        }
        Ok(())
    }

    /// Stream the records in order, batch by batch, consuming the output.
    pub fn drain<F>(self, mut f: F) -> Result<()>
    where
        F: FnMut(&[PairRecord]) -> Result<()>,
    {
        self.replay(&mut f)?;
        self.discard();
        Ok(())
    }

    /// Release backing storage without reading it.
    pub fn discard(self) {
        if let PartialSource::File(path) = &self.source {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove partial output");
            }
        }
    }

    /// Stream the records in order, batch by batch, keeping the output.
    pub fn replay<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[PairRecord]) -> Result<()>,
    {
        match &self.source {
            PartialSource::Memory(records) => {
                for batch in records.chunks(READ_BATCH) {
                    f(batch)?;
                }
                Ok(())
            }
            PartialSource::File(path) => {
                let file = File::open(path)?;
                let bytes = file.metadata()?.len();
                if bytes % RECORD_LEN as u64 != 0 {
                    return Err(self.corrupt("truncated record".to_string()));
                }
                let mut left = bytes / RECORD_LEN as u64;
                let mut reader = BufReader::new(file);
                let mut batch = Vec::with_capacity(READ_BATCH);
                while left > 0 {
                    let take = left.min(READ_BATCH as u64);
                    batch.clear();
                    for _ in 0..take {
                        batch.push(PairRecord::read_from(&mut reader)?);
                    }
                    f(&batch)?;
                    left -= take;
                }
                Ok(())
            }
        }
    }

    fn corrupt(&self, reason: String) -> PairwiseError {
        PairwiseError::CorruptPartial {
            worker: self.range.worker,
            reason,
        }
    }
}

/// Keeps each partial in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySinks;

impl SinkFactory for MemorySinks {
    fn open(&self, range: &SubRange) -> Result<Box<dyn PartialSink>> {
        Ok(Box::new(MemorySink {
            range: *range,
            records: Vec::new(),
            hasher: Sha256::new(),
        }))
    }
}

struct MemorySink {
    range: SubRange,
    records: Vec<PairRecord>,
    hasher: Sha256,
}

impl PartialSink for MemorySink {
    fn append(&mut self, records: &[PairRecord]) -> Result<()> {
        for record in records {
            self.hasher.update(record.encode());
        }
        self.records.extend_from_slice(records);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PartialOutput> {
        let this = *self;
        Ok(PartialOutput {
            range: this.range,
            records: this.records.len() as u64,
            digest: this.hasher.finalize().into(),
            source: PartialSource::Memory(this.records),
        })
    }

    fn abort(self: Box<Self>) {}
}

/// One file per worker under `dir`, named `part-<worker>.bin`.
#[derive(Debug, Clone)]
pub struct FileSinks {
    dir: PathBuf,
}

impl FileSinks {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn path_for(&self, worker: usize) -> PathBuf {
        self.dir.join(format!("part-{:05}.bin", worker))
    }
}

impl SinkFactory for FileSinks {
    fn open(&self, range: &SubRange) -> Result<Box<dyn PartialSink>> {
        let path = self.path_for(range.worker);
        let file = File::create(&path)?;
        Ok(Box::new(FileSink {
            range: *range,
            out: BufWriter::new(file),
            path,
            records: 0,
            hasher: Sha256::new(),
        }))
    }
}

struct FileSink {
    range: SubRange,
    out: BufWriter<File>,
    path: PathBuf,
    records: u64,
    hasher: Sha256,
}

impl PartialSink for FileSink {
    fn append(&mut self, records: &[PairRecord]) -> Result<()> {
        for record in records {
            let bytes = record.encode();
            self.hasher.update(bytes);
            self.out.write_all(&bytes)?;
        }
        self.records += records.len() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PartialOutput> {
        let FileSink {
            range,
            out,
            path,
            records,
            hasher,
        } = *self;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(PartialOutput {
            range,
            records,
            digest: hasher.finalize().into(),
            source: PartialSource::File(path),
        })
    }

    fn abort(self: Box<Self>) {
        let FileSink { out, path, .. } = *self;
        drop(out);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove aborted partial output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn range(worker: usize) -> SubRange {
        SubRange {
            worker,
            from_pos: 0,
            to_pos: 3,
        }
    }

    fn records() -> Vec<PairRecord> {
        vec![
            PairRecord { row: 0, col: 1, value: 0.25 },
            PairRecord { row: 0, col: 2, value: -1.5 },
            PairRecord { row: 1, col: 2, value: 3.0 },
        ]
    }

    fn collect(out: PartialOutput) -> Vec<PairRecord> {
        let mut got = Vec::new();
        out.drain(|batch| {
            got.extend_from_slice(batch);
            Ok(())
        })
        .unwrap();
        got
    }

    #[test]
    fn test_record_encoding() {
        let rec = PairRecord { row: 70_000, col: 1 << 33, value: -0.125 };
        let bytes = rec.encode();
        assert_eq!(&bytes[..8], &70_000u64.to_le_bytes());
        assert_eq!(PairRecord::decode(&bytes), rec);
        assert_eq!(PairRecord::read_from(&mut &bytes[..]).unwrap(), rec);
        assert!(PairRecord::read_from(&mut &bytes[..RECORD_LEN - 1]).is_err());
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySinks.open(&range(0)).unwrap();
        sink.append(&records()[..2]).unwrap();
        sink.append(&records()[2..]).unwrap();
        let out = sink.finish().unwrap();
        assert_eq!(out.records(), 3);
        assert!(out.path().is_none());
        out.verify().unwrap();
        assert_eq!(collect(out), records());
    }

    #[test]
    fn test_file_sink_digest_matches_memory() {
        let dir = tempdir().unwrap();
        let sinks = FileSinks::new(dir.path().join("parts")).unwrap();

        let mut file_sink = sinks.open(&range(7)).unwrap();
        file_sink.append(&records()).unwrap();
        let file_out = file_sink.finish().unwrap();

        let mut mem_sink = MemorySinks.open(&range(7)).unwrap();
        mem_sink.append(&records()).unwrap();
        let mem_out = mem_sink.finish().unwrap();

        assert_eq!(file_out.digest_hex(), mem_out.digest_hex());
        let path = file_out.path().unwrap().to_path_buf();
        assert!(path.ends_with("part-00007.bin"));
        assert_eq!(fs::metadata(&path).unwrap().len(), 3 * RECORD_LEN as u64);

        file_out.verify().unwrap();
        assert_eq!(collect(file_out), records());
        assert!(!path.exists());
    }

    #[test]
    fn test_tampered_file_fails_verification() {
        let dir = tempdir().unwrap();
        let sinks = FileSinks::new(dir.path()).unwrap();
        let mut sink = sinks.open(&range(1)).unwrap();
        sink.append(&records()).unwrap();
        let out = sink.finish().unwrap();

        let path = out.path().unwrap().to_path_buf();
        let mut bytes = fs::read(&path).unwrap();
        bytes[17] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            out.verify(),
            Err(PairwiseError::CorruptPartial { worker: 1, .. })
        ));

        fs::write(&path, &bytes[..RECORD_LEN * 2 + 3]).unwrap();
        assert!(matches!(
            out.verify(),
            Err(PairwiseError::CorruptPartial { worker: 1, .. })
        ));
    }

    #[test]
    fn test_abort_removes_file() {
        let dir = tempdir().unwrap();
        let sinks = FileSinks::new(dir.path()).unwrap();
        let mut sink = sinks.open(&range(2)).unwrap();
        sink.append(&records()).unwrap();
        sink.abort();
        assert!(!sinks.path_for(2).exists());
    }
}
