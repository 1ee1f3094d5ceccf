//! Layer archives.
//!
//! A layer is a flat archive of filesystem entries. Job root filesystems are
//! built by unpacking a job's layers in order, later layers shadowing earlier
//! ones.
//!
//! Encoding (all integers big-endian):
//!
//! ```text
//! magic      b"HOPLAYR1"
//! entry*     kind:u8  mode:u32  path_len:u16  path
//!            kind 1 (directory): no payload
//!            kind 2 (file):      len:u64 data
//!            kind 3 (symlink):   target_len:u16 target
//! end        kind 0
//! ```
//!
//! Paths are relative to the layer root, `/`-separated, and contain no empty,
//! `.` or `..` components. Each path appears at most once per layer.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::{StoreError, StoreResult};

pub const MAGIC: &[u8; 8] = b"HOPLAYR1";

const KIND_END: u8 = 0;
const KIND_DIRECTORY: u8 = 1;
const KIND_FILE: u8 = 2;
const KIND_SYMLINK: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEntryKind {
    Directory,
    /// A regular file of `size` bytes. The contents are read through
    /// [`LayerReader::contents`].
    File { size: u64 },
    Symlink { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub path: String,
    pub mode: u32,
    pub kind: LayerEntryKind,
}

/// Normalize a user-supplied path. A leading `/` is accepted and dropped.
fn normalize(path: &str) -> StoreResult<String> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    validate(trimmed)?;
    Ok(trimmed.to_string())
}

fn validate(path: &str) -> StoreResult<()> {
    if path.is_empty() {
        return Err(StoreError::InvalidLayer("empty path".into()));
    }
    if path.len() > u16::MAX as usize {
        return Err(StoreError::InvalidLayer(format!(
            "path too long: {} bytes",
            path.len()
        )));
    }
    if path.contains('\0') {
        return Err(StoreError::InvalidLayer(format!("path contains NUL: {path:?}")));
    }
    for component in path.split('/') {
        match component {
            "" | "." | ".." => {
                return Err(StoreError::InvalidLayer(format!(
                    "invalid path component in {path:?}"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Builds a layer archive in memory.
#[derive(Debug)]
pub struct LayerBuilder {
    buf: BytesMut,
    seen: HashSet<String>,
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerBuilder {
    pub fn new() -> Self {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        Self {
            buf,
            seen: HashSet::new(),
        }
    }

    fn header(&mut self, kind: u8, path: &str, mode: u32) -> StoreResult<()> {
        let path = normalize(path)?;
        if !self.seen.insert(path.clone()) {
            return Err(StoreError::InvalidLayer(format!("duplicate path: {path}")));
        }
        self.buf.put_u8(kind);
        self.buf.put_u32(mode & 0o7777);
        self.buf.put_u16(path.len() as u16);
        self.buf.put_slice(path.as_bytes());
        Ok(())
    }

    pub fn add_directory(&mut self, path: &str, mode: u32) -> StoreResult<&mut Self> {
        self.header(KIND_DIRECTORY, path, mode)?;
        Ok(self)
    }

    pub fn add_file(&mut self, path: &str, mode: u32, data: &[u8]) -> StoreResult<&mut Self> {
        self.header(KIND_FILE, path, mode)?;
        self.buf.put_u64(data.len() as u64);
        self.buf.put_slice(data);
        Ok(self)
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) -> StoreResult<&mut Self> {
        if target.is_empty() || target.len() > u16::MAX as usize || target.contains('\0') {
            return Err(StoreError::InvalidLayer(format!(
                "invalid symlink target for {path}: {target:?}"
            )));
        }
        self.header(KIND_SYMLINK, path, 0o777)?;
        self.buf.put_u16(target.len() as u16);
        self.buf.put_slice(target.as_bytes());
        Ok(self)
    }

    /// Add a host file or directory tree under `dest`. Directory entries are
    /// added in name order so the same tree always produces the same bytes.
    pub fn add_path_recursive(&mut self, source: &Path, dest: &str) -> StoreResult<&mut Self> {
        let meta = std::fs::symlink_metadata(source)?;
        let file_type = meta.file_type();
        let mode = meta.permissions().mode();

        if file_type.is_symlink() {
            let target = std::fs::read_link(source)?;
            let target = target.to_str().ok_or_else(|| {
                StoreError::InvalidLayer(format!("non-UTF-8 symlink target: {}", source.display()))
            })?;
            self.add_symlink(dest, target)?;
        } else if file_type.is_dir() {
            // The layer root itself has no entry.
            if !dest.trim_matches('/').is_empty() {
                self.add_directory(dest, mode)?;
            }
            let mut children: Vec<_> = std::fs::read_dir(source)?.collect::<io::Result<_>>()?;
            children.sort_by_key(|e| e.file_name());
            for child in children {
                let name = child.file_name();
                let name = name.to_str().ok_or_else(|| {
                    StoreError::InvalidLayer(format!("non-UTF-8 file name: {}", child.path().display()))
                })?;
                let child_dest = format!("{}/{name}", dest.trim_end_matches('/'));
                self.add_path_recursive(&child.path(), &child_dest)?;
            }
        } else if file_type.is_file() {
            let data = std::fs::read(source)?;
            self.add_file(dest, mode, &data)?;
        } else {
            return Err(StoreError::InvalidLayer(format!(
                "unsupported file type: {}",
                source.display()
            )));
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn finish(mut self) -> Bytes {
        self.buf.put_u8(KIND_END);
        self.buf.freeze()
    }
}

/// Streaming reader over a layer archive.
pub struct LayerReader<R> {
    inner: R,
    /// Unread bytes of the current file entry.
    pending: u64,
    done: bool,
    seen: HashSet<String>,
}

impl<R: Read> LayerReader<R> {
    pub fn new(mut inner: R) -> StoreResult<Self> {
        let mut magic = [0u8; 8];
        read_exact(&mut inner, &mut magic)?;
        if &magic != MAGIC {
            return Err(StoreError::InvalidLayer("bad magic".into()));
        }
        Ok(Self {
            inner,
            pending: 0,
            done: false,
            seen: HashSet::new(),
        })
    }

    /// The next entry, or `None` at the end of the archive. Unread contents
    /// of the previous file entry are skipped.
    pub fn next_entry(&mut self) -> StoreResult<Option<LayerEntry>> {
        if self.done {
            return Ok(None);
        }
        if self.pending > 0 {
            let skipped = io::copy(&mut (&mut self.inner).take(self.pending), &mut io::sink())?;
            if skipped != self.pending {
                return Err(truncated());
            }
            self.pending = 0;
        }

        let kind = self.read_u8()?;
        if kind == KIND_END {
            self.done = true;
            return Ok(None);
        }
        let mode = self.read_u32()?;
        let path = self.read_string()?;
        validate(&path)?;
        if !self.seen.insert(path.clone()) {
            return Err(StoreError::InvalidLayer(format!("duplicate path: {path}")));
        }

        let kind = match kind {
            KIND_DIRECTORY => LayerEntryKind::Directory,
            KIND_FILE => {
                let size = self.read_u64()?;
                self.pending = size;
                LayerEntryKind::File { size }
            }
            KIND_SYMLINK => LayerEntryKind::Symlink {
                target: self.read_string()?,
            },
            other => {
                return Err(StoreError::InvalidLayer(format!("unknown entry kind {other}")));
            }
        };
        Ok(Some(LayerEntry { path, mode, kind }))
    }

    /// Contents of the file entry just returned by [`Self::next_entry`].
    pub fn contents(&mut self) -> FileContents<'_, R> {
        FileContents { reader: self }
    }

    fn read_u8(&mut self) -> StoreResult<u8> {
        let mut b = [0u8; 1];
        read_exact(&mut self.inner, &mut b)?;
        Ok(b[0])
    }

    fn read_u16(&mut self) -> StoreResult<u16> {
        let mut b = [0u8; 2];
        read_exact(&mut self.inner, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn read_u32(&mut self) -> StoreResult<u32> {
        let mut b = [0u8; 4];
        read_exact(&mut self.inner, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn read_u64(&mut self) -> StoreResult<u64> {
        let mut b = [0u8; 8];
        read_exact(&mut self.inner, &mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn read_string(&mut self) -> StoreResult<String> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        read_exact(&mut self.inner, &mut buf)?;
        String::from_utf8(buf).map_err(|_| StoreError::InvalidLayer("non-UTF-8 string".into()))
    }
}

/// Reader over one file entry's contents.
pub struct FileContents<'a, R> {
    reader: &'a mut LayerReader<R>,
}

impl<R: Read> Read for FileContents<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reader.pending == 0 {
            return Ok(0);
        }
        let max = buf.len().min(self.reader.pending.min(usize::MAX as u64) as usize);
        let n = self.reader.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "layer truncated inside file contents",
            ));
        }
        self.reader.pending -= n as u64;
        Ok(n)
    }
}

fn truncated() -> StoreError {
    StoreError::InvalidLayer("unexpected end of layer".into())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> StoreResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => truncated(),
        _ => StoreError::Io(e),
    })
}
