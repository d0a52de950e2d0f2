//! Standard streams handed to commands.

use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Create a pipe connecting two pipeline stages.
///
/// The reader sees end of file once every clone of the returned [`Output`]
/// is dropped. Writes fail with [`io::ErrorKind::BrokenPipe`] once every
/// clone of the [`Input`] is gone.
pub fn pipe() -> io::Result<(Input, Output)> {
    let (reader, writer) = io::pipe()?;
    let writer = Arc::new(writer);
    let output = Output {
        sink: Arc::new(Mutex::new(Box::new(SharedPipe(writer.clone())))),
        pipe: Some(writer),
    };
    Ok((Input::Pipe(Arc::new(reader)), output))
}

struct SharedPipe(Arc<PipeWriter>);

impl Write for SharedPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A shareable output stream.
///
/// Clones write to the same underlying sink, so the stream can be handed
/// to several pipeline stages and stdio pumps at once.
#[derive(Clone)]
pub struct Output {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    pipe: Option<Arc<PipeWriter>>,
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output").finish_non_exhaustive()
    }
}

impl Output {
    /// Wrap any writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
            pipe: None,
        }
    }

    /// The host process's stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// The host process's stderr.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Discard everything.
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    /// An in-memory stream and a handle to read back what was written.
    pub fn buffer() -> (Self, SharedBuffer) {
        let buf = SharedBuffer::default();
        (Self::new(buf.clone()), buf)
    }

    /// A duplicate of the write end when this stream is a pipe, so a child
    /// process can write to it directly.
    pub fn pipe_writer(&self) -> Option<io::Result<PipeWriter>> {
        self.pipe.as_ref().map(|p| p.try_clone())
    }

    /// Write all of `data` and flush.
    pub fn write_bytes(&self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        inner.write_all(data)?;
        inner.flush()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
    }
}

/// Growable byte buffer shared between writers and a reader.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Copy of the bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Contents as (lossy) UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    /// Take the contents, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where a command's standard input comes from.
#[derive(Debug, Clone, Default)]
pub enum Input {
    /// Empty input
    #[default]
    Null,
    /// A fixed buffer, e.g. the previous pipeline stage or a here-string
    Bytes(Arc<[u8]>),
    /// The host process's stdin
    Inherit,
    /// Read end of a pipe fed by an earlier pipeline stage
    Pipe(Arc<PipeReader>),
}

impl Input {
    /// Input fed from a byte buffer.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(Arc::from(data.into()))
    }

    /// Read the whole input.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader().read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// A blocking reader over the input, for consumers that may stop early.
    pub fn reader(&self) -> Box<dyn Read + Send> {
        match self {
            Self::Null => Box::new(io::empty()),
            Self::Bytes(data) => Box::new(io::Cursor::new(data.clone())),
            Self::Inherit => Box::new(io::stdin()),
            Self::Pipe(reader) => Box::new(SharedReader(reader.clone())),
        }
    }

    /// A duplicate of the read end when this input is a pipe, so a child
    /// process can read from it directly.
    pub fn pipe_reader(&self) -> Option<io::Result<PipeReader>> {
        match self {
            Self::Pipe(reader) => Some(reader.try_clone()),
            _ => None,
        }
    }
}

struct SharedReader(Arc<PipeReader>);

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self.0).read(buf)
    }
}

/// The three standard streams of a command.
#[derive(Debug, Clone)]
pub struct Stdio {
    /// Standard input
    pub stdin: Input,
    /// Standard output
    pub stdout: Output,
    /// Standard error
    pub stderr: Output,
}

impl Stdio {
    /// The host process's streams.
    pub fn inherit() -> Self {
        Self {
            stdin: Input::Inherit,
            stdout: Output::stdout(),
            stderr: Output::stderr(),
        }
    }

    /// Empty input and in-memory outputs, returned as (stdio, stdout, stderr).
    pub fn captured() -> (Self, SharedBuffer, SharedBuffer) {
        let (stdout, out) = Output::buffer();
        let (stderr, err) = Output::buffer();
        let stdio = Self {
            stdin: Input::Null,
            stdout,
            stderr,
        };
        (stdio, out, err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_output_clones_share_sink() {
        let (out, buf) = Output::buffer();
        let mut a = out.clone();
        let mut b = out;
        write!(a, "one ").unwrap();
        write!(b, "two").unwrap();
        assert_eq!(buf.to_string_lossy(), "one two");
        assert_eq!(buf.take(), b"one two");
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn test_input_read_all() {
        assert!(Input::Null.read_all().unwrap().is_empty());
        assert_eq!(Input::bytes("abc").read_all().unwrap(), b"abc");
    }

    #[test]
    fn test_pipe_closes_with_last_clone() {
        let (input, output) = pipe().unwrap();
        let writer = output.clone();
        let handle = std::thread::spawn(move || input.read_all().unwrap());
        output.write_bytes(b"one ").unwrap();
        drop(output);
        writer.write_bytes(b"two").unwrap();
        drop(writer);
        assert_eq!(handle.join().unwrap(), b"one two");
    }

    #[test]
    fn test_pipe_write_fails_once_reader_gone() {
        let (input, output) = pipe().unwrap();
        drop(input);
        let err = output.write_bytes(b"lost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
