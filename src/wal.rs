use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encode a single record as `[len][bincode][crc32]`. Returns the bytes written.
fn encode_record<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next record. `Ok(None)` marks the end of the usable log:
/// clean EOF, a truncated tail, a CRC mismatch or an undecodable payload.
fn decode_record<R: DeserializeOwned>(reader: &mut impl Read) -> io::Result<Option<R>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

/// Append-only journal of `R` records.
///
/// Entry format: `[u32 LE: len][bincode: R][u32 LE: crc32 of payload]`.
/// A crash mid-append leaves a short or mismatching tail, which replay drops.
///
/// Records count as committed once `flush_sync` returns Ok. Anything buffered
/// or written after that point can be discarded with `rollback`.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    committed_len: u64,
    pending_len: u64,
    pending_records: u64,
    appends_since_compact: u64,
    _record: PhantomData<fn(R)>,
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Open (or create) the journal at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            pending_len: 0,
            pending_records: 0,
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append and fsync one record. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer one record without flushing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        // Serialize up front so a bad record leaves the buffer untouched.
        let mut encoded = Vec::new();
        let len = encode_record(&mut encoded, record)?;
        self.writer.write_all(&encoded)?;
        self.pending_len += len;
        self.pending_records += 1;
        Ok(())
    }

    /// Flush the buffer and fsync the file. On success every pending record
    /// is committed.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.appends_since_compact += self.pending_records;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Discard every record since the last successful `flush_sync`, both
    /// buffered and already written, by truncating to the committed length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // The old writer flushes its leftovers on drop; the truncate below removes them.
        self.writer = BufWriter::new(file);
        self.writer.get_ref().set_len(self.committed_len)?;
        self.writer.get_ref().sync_all()?;
        self.pending_len = 0;
        self.pending_records = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the journal with `records`: write a temp file, fsync, rename over.
    pub fn compact(&mut self, records: &[R]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut written = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                written += encode_record(&mut writer, record)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.committed_len = written;
        self.pending_len = 0;
        self.pending_records = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Read every valid record from disk. A missing file is an empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        while let Some(record) = decode_record(&mut reader)? {
            records.push(record);
        }
        Ok(records)
    }
}
