//! Storage queries and the recordings archive

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use sysinfo::Disks;
use tempfile::SpooledTempFile;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Bytes of the current archive entry kept in memory before it spills to disk
const SPOOL_MEMORY_LIMIT: usize = 4 * 1024 * 1024;

/// Free space of the filesystem recordings land on
pub trait DiskSpace: Send + Sync {
    fn free_space(&self) -> io::Result<u64>;
}

/// Reports the space available on the filesystem mounted at `/`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn free_space(&self) -> io::Result<u64> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .map(|disk| disk.available_space())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no filesystem mounted at /"))
    }
}

/// Total size of regular files under `path`, symlinks are not followed.
/// A missing folder counts as empty.
pub fn folder_size(path: &Path) -> io::Result<u64> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut total = 0;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            total += folder_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Names of the files directly inside `folder` that go into the archive,
/// sorted. Subdirectories are skipped.
pub fn archive_entries(folder: &Path) -> io::Result<Vec<OsString>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names)
}

/// Write an uncompressed zip of `names` (relative to `folder`) into `sink`
/// as it is produced. Each entry is forwarded once it is complete, so at
/// most one entry is held back at a time. Files removed since they were
/// listed are skipped. Returns the number of entries written.
pub fn write_archive<W: Write>(folder: &Path, names: &[OsString], sink: W) -> io::Result<usize> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);

    let mut zip = ZipWriter::new(EntrySpool::new(sink));
    zip.set_flush_on_finish_file(true);

    let mut written = 0;
    for name in names {
        let mut source = match File::open(folder.join(name)) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{:?} disappeared before it could be archived", name);
                continue;
            }
            Err(e) => return Err(e),
        };
        zip.start_file(name.to_string_lossy(), options)
            .map_err(io::Error::other)?;
        io::copy(&mut source, &mut zip)?;
        written += 1;
    }

    let mut spool = zip.finish().map_err(io::Error::other)?;
    spool.flush()?;
    debug!("Archived {} file(s) from {:?}", written, folder);
    Ok(written)
}

/// Seekable front for a forward-only sink.
///
/// `ZipWriter` seeks back into the entry it just finished to patch the local
/// header. Everything written since the last flush stays in the spool and
/// can be rewritten; a flush hands it to the sink and it can no longer be
/// reached.
struct EntrySpool<W> {
    sink: W,
    spool: SpooledTempFile,
    /// Bytes already handed to the sink
    forwarded: u64,
    /// Bytes held in the spool
    held: u64,
}

impl<W: Write> EntrySpool<W> {
    fn new(sink: W) -> Self {
        Self {
            sink,
            spool: SpooledTempFile::new(SPOOL_MEMORY_LIMIT),
            forwarded: 0,
            held: 0,
        }
    }
}

impl<W: Write> Write for EntrySpool<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.spool.write(buf)?;
        let end = self.spool.stream_position()?;
        self.held = self.held.max(end);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.held > 0 {
            self.spool.seek(SeekFrom::Start(0))?;
            let copied = io::copy(&mut (&mut self.spool).take(self.held), &mut self.sink)?;
            if copied != self.held {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "archive spool ended early",
                ));
            }
            self.forwarded += self.held;
            self.held = 0;
            self.spool.set_len(0)?;
            self.spool.seek(SeekFrom::Start(0))?;
        }
        self.sink.flush()
    }
}

impl<W: Write> Seek for EntrySpool<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => (self.forwarded + self.held).checked_add_signed(delta),
            SeekFrom::Current(delta) => {
                let current = self.forwarded + self.spool.stream_position()?;
                current.checked_add_signed(delta)
            }
        };
        match target {
            Some(target) if target >= self.forwarded => {
                self.spool.seek(SeekFrom::Start(target - self.forwarded))?;
                Ok(target)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot seek into archive data already sent",
            )),
        }
    }
}
