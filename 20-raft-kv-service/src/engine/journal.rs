//! Durable write-ahead journal for the Raft log.
//!
//! Every change the worker makes to its `MemStorage` is also appended here as a
//! record, and replaying the records in order rebuilds the same storage after a
//! restart. Compaction rewrites the file as snapshot + hard state + conf state +
//! the entries after the snapshot.
//!
//! Record layout:
//! - 1 byte: record kind
//! - 4 bytes: payload length (big-endian u32)
//! - 4 bytes: CRC-32 of the kind byte and payload (big-endian u32)
//! - N bytes: protobuf-encoded raft message
//!
//! A record that fails its checksum is only forgiven as the last one in the
//! file, where it is a torn write. Anywhere else the journal refuses to open.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use tracing::{debug, warn};

const JOURNAL_FILE: &str = "raft.journal";
const RECORD_HEADER_LEN: u64 = 9;
/// Upper bound on a single record; anything larger is treated as corruption.
const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

const KIND_HARD_STATE: u8 = 1;
const KIND_ENTRY: u8 = 2;
const KIND_CONF_STATE: u8 = 3;
const KIND_SNAPSHOT: u8 = 4;

pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    /// Opens (or creates) the journal in `dir`, replaying existing records into `mem`.
    ///
    /// Returns the journal and the most recent snapshot found, or an empty
    /// snapshot if there was none. A torn record at the tail (crash mid-write)
    /// is cut off.
    pub fn open(dir: &Path, mem: &MemStorage) -> io::Result<(Self, Snapshot)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);

        let (latest, valid_len) = if path.exists() {
            replay(&path, mem)?
        } else {
            (Snapshot::default(), 0)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.metadata()?.len() != valid_len {
            warn!(path = %path.display(), valid_len, "truncating torn journal tail");
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
            },
            latest,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> io::Result<()> {
        for entry in entries {
            write_record(&mut self.writer, KIND_ENTRY, entry)?;
        }
        Ok(())
    }

    pub fn write_hard_state(&mut self, hard_state: &HardState) -> io::Result<()> {
        write_record(&mut self.writer, KIND_HARD_STATE, hard_state)
    }

    pub fn write_conf_state(&mut self, conf_state: &ConfState) -> io::Result<()> {
        write_record(&mut self.writer, KIND_CONF_STATE, conf_state)
    }

    pub fn write_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        write_record(&mut self.writer, KIND_SNAPSHOT, snapshot)
    }

    /// Flushes buffered records and waits for them to reach the disk.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    /// Replaces the journal with a compacted copy.
    ///
    /// `entries` must all come after `snapshot`'s index. The new file is written
    /// beside the old one and renamed over it, so a crash leaves one of the two.
    pub fn rewrite(
        &mut self,
        snapshot: &Snapshot,
        hard_state: &HardState,
        conf_state: &ConfState,
        entries: &[Entry],
    ) -> io::Result<()> {
        self.sync()?;

        let tmp = self.path.with_extension("journal.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            write_record(&mut out, KIND_SNAPSHOT, snapshot)?;
            write_record(&mut out, KIND_HARD_STATE, hard_state)?;
            write_record(&mut out, KIND_CONF_STATE, conf_state)?;
            for entry in entries {
                write_record(&mut out, KIND_ENTRY, entry)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        debug!(
            path = %self.path.display(),
            snapshot_index = snapshot.get_metadata().index,
            entries = entries.len(),
            "journal compacted"
        );
        Ok(())
    }
}

fn checksum(kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(payload);
    hasher.finalize()
}

fn write_record<W: Write, M: ProstMessage>(out: &mut W, kind: u8, message: &M) -> io::Result<()> {
    let payload = message.encode_to_vec();
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("journal record of {} bytes exceeds limit", payload.len()),
        ));
    }
    out.write_all(&[kind])?;
    out.write_all(&(payload.len() as u32).to_be_bytes())?;
    out.write_all(&checksum(kind, &payload).to_be_bytes())?;
    out.write_all(&payload)
}

/// Makes a rename inside `path`'s directory durable.
#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

enum ReadOutcome {
    Record { kind: u8, payload: Vec<u8> },
    /// Clean end of file, or a record cut short by a crash.
    End,
    ChecksumMismatch { expected: u32, actual: u32 },
}

fn read_record<R: Read>(reader: &mut R) -> io::Result<ReadOutcome> {
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadOutcome::End),
        Err(err) => return Err(err),
    }
    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let expected = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    if len > MAX_RECORD_LEN {
        return Err(invalid_data(format!("journal record length {len} exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(ReadOutcome::End),
        Err(err) => return Err(err),
    }
    let actual = checksum(kind, &payload);
    if actual != expected {
        return Ok(ReadOutcome::ChecksumMismatch { expected, actual });
    }
    Ok(ReadOutcome::Record { kind, payload })
}

fn replay(path: &Path, mem: &MemStorage) -> io::Result<(Snapshot, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut latest = Snapshot::default();
    let mut offset = 0u64;
    let mut records = 0usize;

    loop {
        let (kind, payload) = match read_record(&mut reader)? {
            ReadOutcome::Record { kind, payload } => (kind, payload),
            ReadOutcome::End => break,
            ReadOutcome::ChecksumMismatch { expected, actual } => {
                if reader.fill_buf()?.is_empty() {
                    warn!(path = %path.display(), offset, "journal tail fails its checksum");
                    break;
                }
                return Err(invalid_data(format!(
                    "journal record at offset {offset} is corrupt \
                     (checksum {actual:#010x}, expected {expected:#010x})"
                )));
            }
        };
        match kind {
            KIND_HARD_STATE => {
                let hard_state = HardState::decode(&payload[..]).map_err(invalid_data)?;
                mem.wl().set_hardstate(hard_state);
            }
            KIND_ENTRY => {
                let entry = Entry::decode(&payload[..]).map_err(invalid_data)?;
                mem.wl().append(&[entry]).map_err(invalid_data)?;
            }
            KIND_CONF_STATE => {
                let conf_state = ConfState::decode(&payload[..]).map_err(invalid_data)?;
                mem.wl().set_conf_state(conf_state);
            }
            KIND_SNAPSHOT => {
                let snapshot = Snapshot::decode(&payload[..]).map_err(invalid_data)?;
                mem.wl()
                    .apply_snapshot(snapshot.clone())
                    .map_err(invalid_data)?;
                latest = snapshot;
            }
            other => return Err(invalid_data(format!("unknown journal record kind {other}"))),
        }
        offset += RECORD_HEADER_LEN + payload.len() as u64;
        records += 1;
    }

    debug!(path = %path.display(), records, offset, "journal replayed");
    Ok((latest, offset))
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}
