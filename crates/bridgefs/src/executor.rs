//! Filesystem operation executor.
//!
//! The only module that touches the real filesystem. Every public method
//! resolves its path inside the configured root, performs one operation
//! through `tokio::fs`, and translates OS errors into the wire error
//! taxonomy. A semaphore bounds how many filesystem calls run at once so a
//! burst of concurrent path operations cannot exhaust the blocking pool.
//!
//! File and directory state attached to a handle lives in [`HandleResource`];
//! the executor mutates it but the lane worker owns it.

use crate::config::Config;
use crate::protocol::{Attrs, DirEntry, EntryKind, OpenFlags, TimeSpec};
use crate::{Error, Result};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::debug;

/// An open file attached to a handle
#[derive(Debug)]
pub struct FileResource {
    pub file: fs::File,
    pub path: PathBuf,
    /// Byte position after the last read/write; used when the client sends
    /// a negative offset
    pub position: u64,
    pub readable: bool,
    pub writable: bool,
    pub append: bool,
}

/// An open directory stream attached to a handle
#[derive(Debug)]
pub struct DirResource {
    pub path: PathBuf,
    /// Lazily pulled; `None` before the first readdir and after a rewind
    pub stream: Option<fs::ReadDir>,
}

/// What a handle's lane worker owns
#[derive(Debug)]
pub enum HandleResource {
    File(FileResource),
    Dir(DirResource),
}

/// Executes filesystem operations inside the shared root.
#[derive(Debug)]
pub struct Executor {
    root: PathBuf,
    permits: Semaphore,
    readdir_chunk: usize,
    max_read: usize,
}

impl Executor {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.root_dir.clone(),
            permits: Semaphore::new(config.max_fs_concurrency),
            readdir_chunk: config.readdir_chunk,
            max_read: config.max_payload,
        }
    }

    /// Resolve a client path to a real path under the root.
    ///
    /// The path is walked component by component without touching the
    /// filesystem; `..` that would climb above the root is rejected, as are
    /// embedded NUL bytes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(Error::PathEscape("empty path".to_string()));
        }

        if path.contains('\0') {
            return Err(Error::PathEscape(format!("{path:?}: embedded NUL")));
        }

        let mut resolved = self.root.clone();
        let mut depth = 0usize;

        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(Error::PathEscape(path.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::Prefix(_) => {
                    return Err(Error::PathEscape(path.to_string()));
                }
            }
        }

        Ok(resolved)
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| Error::Connection("executor shut down".to_string()))
    }

    /// Attributes of a name inside a parent directory (lstat semantics)
    pub async fn lookup(&self, parent: &str, name: &str) -> Result<Attrs> {
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(Error::PathEscape(format!("invalid entry name {name:?}")));
        }

        let dir = self.resolve(parent)?;
        let target = dir.join(name);
        let _permit = self.permit().await?;

        let metadata = fs::symlink_metadata(&target)
            .await
            .map_err(|e| Error::from_io(e, format!("{parent}/{name}")))?;
        Ok(attrs_from_metadata(&metadata))
    }

    /// Attributes by path (lstat semantics)
    pub async fn stat(&self, path: &str) -> Result<Attrs> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        let metadata = fs::symlink_metadata(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        Ok(attrs_from_metadata(&metadata))
    }

    /// Open a file, producing the resource its handle will own
    pub async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<FileResource> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        let mut options = fs::OpenOptions::new();

        if flags.has_read() {
            options.read(true);
        }
        if flags.has_write() {
            options.write(true);
        }
        if flags.has_append() {
            options.append(true);
        }
        if flags.has_creat() {
            options.create(true);
        }
        if flags.has_trunc() {
            options.truncate(true);
        }
        if flags.has_excl() {
            options.create_new(true);
        }
        #[cfg(unix)]
        options.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        let file = options
            .open(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))?;

        debug!(event = "file_opened", path, flags = flags.0, "opened file");

        Ok(FileResource {
            file,
            path: resolved,
            position: 0,
            readable: flags.has_read(),
            writable: flags.has_write() || flags.has_append(),
            append: flags.has_append(),
        })
    }

    /// Open a directory for streaming reads
    pub async fn opendir(&self, path: &str) -> Result<DirResource> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        let metadata = fs::symlink_metadata(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        if !metadata.is_dir() {
            return Err(Error::WrongType(format!("{path}: not a directory")));
        }

        // The stream is pulled on the first readdir call, not here, so an
        // opendir on a huge directory stays cheap.
        Ok(DirResource {
            path: resolved,
            stream: None,
        })
    }

    /// Create an empty regular file, failing if the name exists
    pub async fn create(&self, path: &str, mode: u32) -> Result<()> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        options
            .open(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        Ok(())
    }

    /// Create a directory
    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        builder
            .create(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    /// Remove an empty directory
    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        fs::remove_dir(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    /// Remove a file
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        fs::remove_file(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    /// Rename a file or directory; both endpoints must be inside the root
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        let _permit = self.permit().await?;

        fs::rename(&src, &dst)
            .await
            .map_err(|e| Error::from_io(e, format!("{from} -> {to}")))
    }

    /// Truncate a file by path
    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let resolved = self.resolve(path)?;
        let _permit = self.permit().await?;

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&resolved)
            .await
            .map_err(|e| Error::from_io(e, path))?;

        file.set_len(size)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    /// Read up to `len` bytes from the file.
    ///
    /// A negative offset means "continue from the tracked position", which
    /// supports clients that stream sequentially without bookkeeping. Short
    /// reads are retried until the buffer is full or EOF; a result shorter
    /// than `len` therefore means end of file.
    ///
    /// `len` is clamped to the payload limit. The request frame carrying a
    /// read is 20 bytes, so the length field alone must not be able to make
    /// the session allocate gigabytes or produce a response the wire format
    /// cannot frame.
    pub async fn read(&self, res: &mut FileResource, offset: i64, len: u32) -> Result<Vec<u8>> {
        if !res.readable {
            return Err(Error::PermissionDenied(format!(
                "{}: handle not open for reading",
                res.path.display()
            )));
        }

        let len = (len as usize).min(self.max_read);
        let _permit = self.permit().await?;

        let start = if offset < 0 {
            res.position
        } else {
            offset as u64
        };

        // The cursor already sits at the tracked position after a
        // successful read or write, so sequential streaming never seeks.
        if start != res.position {
            res.file
                .seek(SeekFrom::Start(start))
                .await
                .map_err(|e| Error::from_io(e, res.path.display().to_string()))?;
        }

        let mut buffer = vec![0u8; len];
        let mut filled = 0usize;

        while filled < buffer.len() {
            let n = res
                .file
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| Error::from_io(e, res.path.display().to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buffer.truncate(filled);
        res.position = start + filled as u64;
        Ok(buffer)
    }

    /// Write the data at the given offset, returning the byte count.
    ///
    /// Negative offsets continue from the tracked position, like reads.
    /// Handles opened for append ignore the offset entirely.
    pub async fn write(&self, res: &mut FileResource, offset: i64, data: &[u8]) -> Result<u64> {
        if !res.writable {
            return Err(Error::PermissionDenied(format!(
                "{}: handle not open for writing",
                res.path.display()
            )));
        }

        let _permit = self.permit().await?;
        let path = res.path.display().to_string();

        if res.append {
            res.file
                .write_all(data)
                .await
                .map_err(|e| Error::from_io(e, path.clone()))?;
            res.position = res
                .file
                .stream_position()
                .await
                .map_err(|e| Error::from_io(e, path))?;
        } else {
            let start = if offset < 0 {
                res.position
            } else {
                offset as u64
            };

            res.file
                .seek(SeekFrom::Start(start))
                .await
                .map_err(|e| Error::from_io(e, path.clone()))?;
            res.file
                .write_all(data)
                .await
                .map_err(|e| Error::from_io(e, path))?;
            res.position = start + data.len() as u64;
        }

        Ok(data.len() as u64)
    }

    /// Flush buffered writes down to the device
    pub async fn flush(&self, res: &mut FileResource) -> Result<()> {
        let _permit = self.permit().await?;
        let path = res.path.display().to_string();

        res.file
            .flush()
            .await
            .map_err(|e| Error::from_io(e, path.clone()))?;
        res.file
            .sync_data()
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    /// Next chunk of directory entries.
    ///
    /// Entries are pulled lazily from the OS stream, at most `readdir_chunk`
    /// per call, in whatever order the filesystem yields them. `rewind`
    /// reopens the stream from the beginning. The returned flag is true once
    /// the stream is exhausted; a subsequent call without rewind returns an
    /// empty chunk with the flag still set.
    pub async fn readdir(
        &self,
        res: &mut DirResource,
        rewind: bool,
    ) -> Result<(Vec<DirEntry>, bool)> {
        let _permit = self.permit().await?;
        let path = res.path.display().to_string();

        if rewind || res.stream.is_none() {
            let stream = fs::read_dir(&res.path)
                .await
                .map_err(|e| Error::from_io(e, path.clone()))?;
            res.stream = Some(stream);
        }

        let stream = match res.stream.as_mut() {
            Some(s) => s,
            None => return Ok((Vec::new(), true)),
        };

        let mut entries = Vec::with_capacity(self.readdir_chunk.min(64));
        let mut eof = false;

        while entries.len() < self.readdir_chunk {
            let next = stream
                .next_entry()
                .await
                .map_err(|e| Error::from_io(e, path.clone()))?;

            let Some(dirent) = next else {
                eof = true;
                res.stream = None;
                break;
            };

            let name = dirent.file_name().to_string_lossy().into_owned();
            // Entry metadata failures (entry vanished between listing and
            // stat) skip the entry rather than failing the whole chunk.
            match dirent.metadata().await {
                Ok(metadata) => {
                    let attrs = attrs_from_metadata(&metadata);
                    let kind = if metadata.is_dir() {
                        EntryKind::Directory
                    } else if metadata.is_symlink() {
                        EntryKind::Symlink
                    } else if metadata.is_file() {
                        EntryKind::File
                    } else {
                        EntryKind::Other
                    };
                    entries.push(DirEntry {
                        name,
                        kind,
                        size: attrs.size,
                        mtime: attrs.mtime,
                    });
                }
                Err(e) => {
                    debug!(
                        event = "readdir_entry_skipped",
                        dir = %path,
                        entry = %name,
                        error = %e,
                        "skipping unreadable directory entry"
                    );
                }
            }
        }

        Ok((entries, eof))
    }
}

#[cfg(unix)]
fn attrs_from_metadata(metadata: &std::fs::Metadata) -> Attrs {
    use std::os::unix::fs::MetadataExt;

    Attrs {
        size: metadata.size(),
        links: metadata.nlink() as u32,
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        atime: TimeSpec {
            secs: metadata.atime(),
            nanos: metadata.atime_nsec() as u32,
        },
        mtime: TimeSpec {
            secs: metadata.mtime(),
            nanos: metadata.mtime_nsec() as u32,
        },
        ctime: TimeSpec {
            secs: metadata.ctime(),
            nanos: metadata.ctime_nsec() as u32,
        },
    }
}

#[cfg(not(unix))]
fn attrs_from_metadata(metadata: &std::fs::Metadata) -> Attrs {
    use std::time::UNIX_EPOCH;

    let to_timespec = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| TimeSpec {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            })
            .unwrap_or_default()
    };

    Attrs {
        size: metadata.len(),
        links: 1,
        mode: if metadata.is_dir() { 0o040755 } else { 0o100644 },
        uid: 0,
        gid: 0,
        atime: to_timespec(metadata.accessed()),
        mtime: to_timespec(metadata.modified()),
        ctime: to_timespec(metadata.modified()),
    }
}
