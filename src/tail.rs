/// Tailing cursor for the worker's append-only log file.
///
/// Each `poll()` returns the bytes appended since the previous poll. The
/// cursor notices when the file shrinks below its offset, is replaced by a
/// different file, or is rewritten in place, and restarts from offset 0 in
/// each of those cases (a new tailing epoch).
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

/// Number of leading bytes remembered to notice in-place rewrites.
const HEAD_LEN: usize = 64;

/// Identity of the file the offset refers to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Fingerprint {
    /// Inode on unix; always 0 elsewhere.
    inode: u64,
    /// First bytes of the file as last seen (up to `HEAD_LEN`).
    head: Vec<u8>,
}

/// Outcome of a single poll.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll {
    /// The file does not exist yet.
    Missing,
    /// Nothing new since the last poll.
    Idle,
    /// New bytes. `reset` is true when a truncation or rotation was detected
    /// and the bytes were read from the start of the file.
    Data { bytes: Vec<u8>, reset: bool },
}

pub struct TailCursor {
    path: PathBuf,
    offset: u64,
    fingerprint: Option<Fingerprint>,
    max_read_bytes: u64,
}

impl TailCursor {
    /// A cursor positioned at the start of `path`.
    pub fn new(path: impl Into<PathBuf>, max_read_bytes: u64) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            fingerprint: None,
            max_read_bytes: max_read_bytes.max(1),
        }
    }

    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read whatever was appended since the last poll, at most
    /// `max_read_bytes` at a time. The offset only moves past bytes that
    /// were actually read.
    pub fn poll(&mut self) -> Result<Poll, TailError> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Poll::Missing),
            Err(e) => return Err(self.io_error(e)),
        };
        let meta = file.metadata().map_err(|e| self.io_error(e))?;
        let len = meta.len();
        let inode = inode_of(&meta);

        let head = read_head(&mut file, len).map_err(|e| self.io_error(e))?;
        let reset = match &self.fingerprint {
            None => false,
            Some(prev) if prev.inode != inode => {
                tracing::info!(path = %self.path.display(), "log file rotated, restarting from offset 0");
                true
            }
            Some(_) if len < self.offset => {
                tracing::info!(
                    path = %self.path.display(),
                    len,
                    offset = self.offset,
                    "log file truncated, restarting from offset 0"
                );
                true
            }
            Some(prev) if !head.starts_with(&prev.head) => {
                tracing::info!(path = %self.path.display(), "log file rewritten, restarting from offset 0");
                true
            }
            Some(_) => false,
        };
        if reset {
            self.offset = 0;
        }
        self.fingerprint = Some(Fingerprint { inode, head });

        if len <= self.offset {
            return Ok(if reset {
                Poll::Data {
                    bytes: Vec::new(),
                    reset,
                }
            } else {
                Poll::Idle
            });
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| self.io_error(e))?;
        let want = (len - self.offset).min(self.max_read_bytes);
        let mut bytes = Vec::with_capacity(want as usize);
        file.take(want)
            .read_to_end(&mut bytes)
            .map_err(|e| self.io_error(e))?;
        self.offset += bytes.len() as u64;

        if bytes.is_empty() && !reset {
            return Ok(Poll::Idle);
        }
        Ok(Poll::Data { bytes, reset })
    }

    /// Jump to `window` bytes before the end of the file when it is longer
    /// than that. Returns the new offset (0 when nothing was skipped) and
    /// whether it falls inside a line.
    pub fn seek_tail(&mut self, window: u64) -> Result<(u64, bool), TailError> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, false)),
            Err(e) => return Err(self.io_error(e)),
        };
        let meta = file.metadata().map_err(|e| self.io_error(e))?;
        let len = meta.len();
        if len <= window {
            return Ok((0, false));
        }
        let offset = len - window;
        let head = read_head(&mut file, len).map_err(|e| self.io_error(e))?;
        let mut before = [0u8; 1];
        file.seek(SeekFrom::Start(offset - 1))
            .and_then(|_| file.read_exact(&mut before))
            .map_err(|e| self.io_error(e))?;

        self.offset = offset;
        self.fingerprint = Some(Fingerprint {
            inode: inode_of(&meta),
            head,
        });
        Ok((offset, before[0] != b'\n'))
    }

    fn io_error(&self, source: std::io::Error) -> TailError {
        TailError {
            path: self.path.clone(),
            source,
        }
    }
}

fn read_head(file: &mut File, len: u64) -> std::io::Result<Vec<u8>> {
    let n = len.min(HEAD_LEN as u64);
    let mut head = Vec::with_capacity(n as usize);
    file.seek(SeekFrom::Start(0))?;
    file.by_ref().take(n).read_to_end(&mut head)?;
    Ok(head)
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Reassembles complete lines from the byte chunks a cursor yields.
///
/// A trailing partial line is held back until its newline arrives, but
/// never more than `max_line_bytes` of it: output that never ends a line
/// is cut into `max_line_bytes` pieces.
#[derive(Debug)]
pub struct LineSplitter {
    pending: Vec<u8>,
    max_line_bytes: usize,
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Feed a chunk and return every line it completes, without the newline.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        if let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') {
            let rest = self.pending.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.pending, rest);
            lines.extend(
                complete[..complete.len() - 1]
                    .split(|&b| b == b'\n')
                    .map(|line| String::from_utf8_lossy(line).into_owned()),
            );
        }
        while self.pending.len() >= self.max_line_bytes {
            let rest = self.pending.split_off(self.max_line_bytes);
            let piece = std::mem::replace(&mut self.pending, rest);
            tracing::debug!(bytes = piece.len(), "unterminated line hit the length cap");
            lines.push(String::from_utf8_lossy(&piece).into_owned());
        }
        lines
    }

    /// Take the held-back partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }

    /// Forget any partial line (used when a new epoch starts).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// I/O failure while tailing (anything other than "file not found").
#[derive(Debug)]
pub struct TailError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to tail {}: {}", self.path.display(), self.source)
    }
}

impl std::error::Error for TailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
