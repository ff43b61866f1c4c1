//! Message body sources and sinks

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{error, trace};

/// Pulls outgoing body bytes into the buffer; `Ok(0)` ends the body.
pub type IoReadFunc = Box<dyn FnMut(&mut [u8]) -> io::Result<usize>>;

/// Receives incoming body bytes; returns how many were taken.
pub type IoWriteFunc = Box<dyn FnMut(&[u8]) -> io::Result<usize>>;

/// Where a parsed body goes. Exactly one is active at a time.
pub(crate) enum BodySink {
    Memory,
    File { path: PathBuf, file: Option<File> },
    Handler(IoWriteFunc),
}

impl BodySink {
    /// Open `path` for writing, truncating it. A failure to open is logged
    /// and surfaces as a write error once body bytes arrive.
    pub(crate) fn file(path: &Path) -> Self {
        let file = match File::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to open body file for writing");
                None
            }
        };
        BodySink::File {
            path: path.to_path_buf(),
            file,
        }
    }

    pub(crate) fn is_memory(&self) -> bool {
        matches!(self, BodySink::Memory)
    }

    /// Hand `data` to the sink; in-memory bodies are appended to `memory`.
    pub(crate) fn write(&mut self, memory: &mut Vec<u8>, data: &[u8]) -> io::Result<()> {
        match self {
            BodySink::Memory => {
                memory.extend_from_slice(data);
                Ok(())
            }
            BodySink::File { path, file } => match file {
                Some(file) => file.write_all(data),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("body file {} is not open", path.display()),
                )),
            },
            BodySink::Handler(handler) => {
                let mut written = 0;
                while written < data.len() {
                    match handler(&data[written..])? {
                        0 => return Err(io::ErrorKind::WriteZero.into()),
                        n => written += n,
                    }
                }
                Ok(())
            }
        }
    }

    /// Flush and release the sink's resources.
    pub(crate) fn close(&mut self) {
        if let BodySink::File { path, file } = self {
            if let Some(mut file) = file.take() {
                if let Err(e) = file.flush() {
                    error!(path = %path.display(), error = %e, "failed to flush body file");
                }
                trace!(path = %path.display(), "closed body file");
            }
        }
    }
}

impl Default for BodySink {
    fn default() -> Self {
        BodySink::Memory
    }
}

impl std::fmt::Debug for BodySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodySink::Memory => f.write_str("Memory"),
            BodySink::File { path, file } => f
                .debug_struct("File")
                .field("path", path)
                .field("open", &file.is_some())
                .finish(),
            BodySink::Handler(_) => f.write_str("Handler"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_memory_sink() {
        let mut sink = BodySink::default();
        let mut memory = Vec::new();
        sink.write(&mut memory, b"abc").unwrap();
        sink.write(&mut memory, b"def").unwrap();
        assert_eq!(memory, b"abcdef");
        assert!(sink.is_memory());
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.bin");
        std::fs::write(&path, b"old contents that must go").unwrap();

        let mut sink = BodySink::file(&path);
        let mut memory = Vec::new();
        sink.write(&mut memory, b"new").unwrap();
        sink.close();

        assert!(memory.is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_unopenable_file_fails_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("body.bin");

        let mut sink = BodySink::file(&path);
        let mut memory = Vec::new();
        assert!(sink.write(&mut memory, b"data").is_err());
    }

    #[test]
    fn test_handler_sink_partial_writes() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let target = received.clone();
        let mut sink = BodySink::Handler(Box::new(move |data: &[u8]| {
            let n = data.len().min(2);
            target.borrow_mut().extend_from_slice(&data[..n]);
            Ok(n)
        }));

        let mut memory = Vec::new();
        sink.write(&mut memory, b"hello").unwrap();
        assert_eq!(&*received.borrow(), b"hello");
    }
}
