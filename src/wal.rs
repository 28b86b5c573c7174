use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

/// One record: `[u32 le: payload len][bincode Event][u32 le: crc32 of payload]`.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(event).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "event too large"))?;
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(record)
}

/// Sequential record reader. Stops at the first record that is short,
/// fails its checksum or does not decode; nothing after it is trusted.
pub struct WalReader<R> {
    inner: R,
    done: bool,
    valid_len: u64,
}

impl<R: Read> WalReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            done: false,
            valid_len: 0,
        }
    }

    /// Bytes covered by the intact records read so far.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// `Ok(false)` if the stream ended before `buf` was full.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn next_event(&mut self) -> io::Result<Option<Event>> {
        if self.done {
            return Ok(None);
        }
        let event = self.read_record()?;
        self.done = event.is_none();
        Ok(event)
    }

    fn read_record(&mut self) -> io::Result<Option<Event>> {
        let mut header = [0u8; HEADER_LEN];
        if !self.fill(&mut header)? {
            return Ok(None);
        }
        let mut payload = vec![0u8; u32::from_le_bytes(header) as usize];
        let mut trailer = [0u8; TRAILER_LEN];
        if !self.fill(&mut payload)? || !self.fill(&mut trailer)? {
            return Ok(None);
        }
        if u32::from_le_bytes(trailer) != crc32fast::hash(&payload) {
            return Ok(None);
        }
        let event: Option<Event> = bincode::deserialize(&payload).ok();
        if event.is_some() {
            self.valid_len += (HEADER_LEN + payload.len() + TRAILER_LEN) as u64;
        }
        Ok(event)
    }
}

/// Append-only write-ahead log of one tenant. Each committed transaction is
/// exactly one record, so after a crash it is either fully present or gone.
///
/// Everything past `durable_len` is unacknowledged. A failed write or sync
/// is undone with `rollback`, which truncates the file back to that offset.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    durable_len: u64,
    pending_len: u64,
    pending_appends: u64,
    torn: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_len: 0,
            pending_appends: 0,
            torn: false,
        })
    }

    /// Read every intact record, cut off anything after the last one, and
    /// open the log for appending. New records never land behind garbage.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::read_intact(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            warn!(
                "{}: dropping {} bytes after the last intact record",
                path.display(),
                meta.len() - valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        Ok((Self::open(path)?, events))
    }

    /// Queue a record in the write buffer. Not durable until `sync`.
    pub fn buffer(&mut self, event: &Event) -> io::Result<()> {
        if self.torn {
            self.rollback()?;
        }
        let record = frame(event)?;
        self.pending_len += record.len() as u64;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        self.out.write_all(&record)
    }

    /// Write out the buffer and fsync. One call covers a whole commit batch.
    pub fn sync(&mut self) -> io::Result<()> {
        if self.torn {
            self.rollback()?;
        }
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        self.durable_len += self.pending_len;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Forget every record since the last successful `sync`: drop what is
    /// still buffered and truncate whatever already reached the file.
    /// Until this succeeds, `buffer` and `sync` retry it first.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.torn = true;
        let fresh = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        // into_parts hands back the unwritten bytes instead of flushing them.
        let (_, _unwritten) = std::mem::replace(&mut self.out, fresh).into_parts();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_len = 0;
        self.pending_appends = 0;

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_data()?;
        self.torn = false;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn snapshot_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Replace the log with `events`. The snapshot is written and synced
    /// beside the log, then renamed over it, so a crash at any point leaves
    /// either the old log or the new one.
    pub fn install_snapshot(&mut self, events: &[Event]) -> io::Result<()> {
        self.sync()?;
        let staged = self.snapshot_path();
        {
            let mut out = BufWriter::new(File::create(&staged)?);
            for event in events {
                out.write_all(&frame(event)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staged, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.out = BufWriter::new(file);
        self.appends_since_compact = 0;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    /// Every intact record in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::read_intact(path).map(|(events, _)| events)
    }

    fn read_intact(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = WalReader::new(BufReader::new(file));
        let mut events = Vec::new();
        while let Some(event) = reader.next_event()? {
            events.push(event);
        }
        Ok((events, reader.valid_len()))
    }
}
