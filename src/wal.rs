use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// Append-only change log.
///
/// Each record is framed as `[u32 len][bincode Change][u32 crc32]`, little
/// endian, where `len` counts only the payload. A torn or corrupt tail is
/// dropped on replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    /// Records buffered since then.
    unsynced: u64,
}

fn write_frame(writer: &mut impl Write, change: &Change) -> io::Result<()> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// The decoded record and its framed size. Ok(None) on a clean end of file
/// or a torn/corrupt frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Change, u64)>> {
    let mut word = [0u8; 4];
    if !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    let mut payload = vec![0u8; len];
    if !read_or_eof(reader, &mut payload)? || !read_or_eof(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|change| (change, len as u64 + 8)))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, change: &Change) -> io::Result<()> {
        self.append_buffered(change)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, change: &Change) -> io::Result<()> {
        write_frame(&mut self.writer, change)?;
        self.appends_since_compact += 1;
        self.unsynced += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.synced_len = file.metadata()?.len();
        self.unsynced = 0;
        Ok(())
    }

    /// Discard everything since the last `flush_sync`: records still in the
    /// buffer and any partial frame that already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        drop(stale.into_parts());
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.unsynced);
        self.unsynced = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot to the side file and fsync it. Slow; the live log is
    /// untouched until `swap_compact_file`.
    pub fn write_compact_file(path: &Path, snapshot: &[Change]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for change in snapshot {
            write_frame(&mut writer, change)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Change]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact record, in write order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then cut the file back to its last intact record so later
    /// appends are not stranded behind a torn or corrupt frame. Returns the
    /// records and the number of bytes dropped.
    pub fn recover(path: &Path) -> io::Result<(Vec<Change>, u64)> {
        let (changes, intact) = Self::scan(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((changes, 0)),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len > intact {
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok((changes, len.saturating_sub(intact)))
    }

    /// Intact records and the byte offset just past the last of them.
    fn scan(path: &Path) -> io::Result<(Vec<Change>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut changes = Vec::new();
        let mut offset = 0;
        while let Some((change, framed)) = read_frame(&mut reader)? {
            changes.push(change);
            offset += framed;
        }
        Ok((changes, offset))
    }
}
