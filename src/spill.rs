//! Temporary sorted runs for blocking stages that exceed their memory budget.
//!
//! Record format: `[crc32: u32 LE][len: u32 LE][payload]`, where the payload
//! is the encoded key followed by the caller's opaque bytes.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher;
use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::value::Value;

pub trait SpillStore {
    fn create_run(&mut self) -> Result<RunHandle>;
}

/// One temp directory per owning stage. Dropping the store removes the
/// directory together with every run still inside it.
pub struct TempDirSpillStore {
    dir: TempDir,
    next_run: usize,
}

impl TempDirSpillStore {
    pub fn new(parent: Option<&Path>) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("oxiagg-spill-");
            b
        };
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!(dir = %dir.path().display(), "created spill directory");
        Ok(Self { dir, next_run: 0 })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl SpillStore for TempDirSpillStore {
    fn create_run(&mut self) -> Result<RunHandle> {
        let path = self.dir.path().join(format!("run-{:05}.spill", self.next_run));
        self.next_run += 1;
        RunHandle::create(path)
    }
}

/// A single sorted run. Records must be appended in key order; the run is
/// read back in exactly the order written.
pub struct RunHandle {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    records: u64,
    bytes: u64,
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

impl RunHandle {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            records: 0,
            bytes: 0,
        })
    }

    pub fn append(&mut self, key: &Value, payload: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::SpillCorrupted(format!("append to finished run {}", self.path.display()))
        })?;
        let mut record = Vec::with_capacity(payload.len() + 32);
        key.write_to(&mut record)?;
        record.extend_from_slice(payload);
        let len = u32::try_from(record.len())
            .map_err(|_| Error::SpillCorrupted("spill record exceeds 4 GiB".into()))?;
        writer.write_all(&compute_crc(&record).to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&record)?;
        self.records += 1;
        self.bytes += 8 + record.len() as u64;
        Ok(())
    }

    /// Flush and close the write side. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn iterate(&self) -> Result<RunReader> {
        if self.writer.is_some() {
            return Err(Error::SpillCorrupted(format!(
                "run {} read before it was finished",
                self.path.display()
            )));
        }
        Ok(RunReader {
            reader: BufReader::new(File::open(&self.path)?),
            path: self.path.clone(),
            remaining: self.records,
        })
    }

    pub fn dispose(mut self) -> Result<()> {
        self.writer = None;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct RunReader {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
}

impl RunReader {
    fn corrupt(&self, what: &str) -> Error {
        Error::SpillCorrupted(format!("{what} in {}", self.path.display()))
    }

    fn read_record(&mut self) -> Result<(Value, Vec<u8>)> {
        let mut header = [0u8; 8];
        self.reader
            .read_exact(&mut header)
            .map_err(|_| self.corrupt("truncated header"))?;
        let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut record = vec![0u8; len];
        self.reader
            .read_exact(&mut record)
            .map_err(|_| self.corrupt("truncated record"))?;
        if compute_crc(&record) != stored_crc {
            return Err(self.corrupt("checksum mismatch"));
        }
        let mut cursor = &record[..];
        let key = Value::read_from(&mut cursor).map_err(|_| self.corrupt("undecodable key"))?;
        let payload = cursor.to_vec();
        Ok((key, payload))
    }
}

impl Iterator for RunReader {
    type Item = Result<(Value, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let record = self.read_record();
        if record.is_err() {
            self.remaining = 0;
        }
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// K-way merge
// ---------------------------------------------------------------------------

struct HeapEntry<T, F> {
    item: T,
    source: usize,
    cmp: Arc<F>,
}

impl<T, F> PartialEq for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, F> Eq for HeapEntry<T, F> where F: Fn(&T, &T) -> Ordering {}

impl<T, F> PartialOrd for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, F> Ord for HeapEntry<T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    // Reversed: `BinaryHeap` pops its greatest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&other.item, &self.item).then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges already-sorted sources. Items comparing equal come out in source
/// order, so earlier runs precede later ones.
pub struct MergeCursor<'a, T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    sources: Vec<Box<dyn Iterator<Item = Result<T>> + 'a>>,
    heap: BinaryHeap<HeapEntry<T, F>>,
    primed: bool,
    cmp: Arc<F>,
}

impl<'a, T, F> MergeCursor<'a, T, F>
where
    F: Fn(&T, &T) -> Ordering,
{
    pub fn new(sources: Vec<Box<dyn Iterator<Item = Result<T>> + 'a>>, cmp: F) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            primed: false,
            cmp: Arc::new(cmp),
        }
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(item) = self.sources[source].next().transpose()? {
            self.heap.push(HeapEntry {
                item,
                source,
                cmp: Arc::clone(&self.cmp),
            });
        }
        Ok(())
    }

    /// Next smallest item and the index of the source it came from.
    pub fn next_item(&mut self) -> Result<Option<(usize, T)>> {
        if !self.primed {
            for i in 0..self.sources.len() {
                self.refill(i)?;
            }
            self.primed = true;
        }
        let Some(HeapEntry { item, source, .. }) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(source)?;
        Ok(Some((source, item)))
    }
}

/// Merge `runs` in batches of `fan_in` until at most `limit` are left, so a
/// final merge never holds more than `limit` files open. `merge` copies one
/// batch, in order, into the output run. Returns the number of passes.
pub fn reduce_runs<S, M>(
    store: &mut S,
    runs: &mut Vec<RunHandle>,
    limit: usize,
    fan_in: usize,
    mut merge: M,
) -> Result<u32>
where
    S: SpillStore + ?Sized,
    M: FnMut(&[RunHandle], &mut RunHandle) -> Result<()>,
{
    let fan_in = fan_in.max(2);
    let limit = limit.max(1);
    let mut passes = 0;
    while runs.len() > limit {
        let before = runs.len();
        let mut pending = std::mem::take(runs).into_iter();
        loop {
            let batch: Vec<RunHandle> = pending.by_ref().take(fan_in).collect();
            match batch.len() {
                0 => break,
                1 => runs.extend(batch),
                _ => {
                    let mut out = store.create_run()?;
                    merge(&batch, &mut out)?;
                    out.finish()?;
                    for run in batch {
                        run.dispose()?;
                    }
                    runs.push(out);
                }
            }
        }
        passes += 1;
        tracing::debug!(pass = passes, before, after = runs.len(), "merged spill runs");
    }
    Ok(passes)
}
