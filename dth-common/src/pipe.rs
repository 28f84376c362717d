//! Line pumps from child process streams into the parent's output.

use crate::types::STATUS_PREFIX;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{trace, warn};

/// Shared, line-atomic output destination.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

impl OutputSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// In-memory sink, returned with a handle to its contents.
    pub fn buffer() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (Self::new(buffer.clone()), buffer)
    }

    /// Write one line, prefixed by `annotation` if given.
    pub fn write_line(&self, annotation: Option<&str>, line: &str) -> io::Result<()> {
        let mut out = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prefix) = annotation {
            out.write_all(prefix.as_bytes())?;
        }
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Cloneable in-memory writer.
#[derive(Clone, Default, Debug)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(|e| e.into_inner())).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A pump thread copying one stream line by line.
pub struct Pipe {
    name: String,
    handle: JoinHandle<Option<String>>,
}

impl Pipe {
    /// Start pumping `reader` into `sink`.
    ///
    /// With `capture_status`, the last line starting with the status prefix is
    /// kept out of the sink and returned from [`join`](Self::join).
    pub fn spawn<R>(
        name: impl Into<String>,
        reader: R,
        sink: OutputSink,
        annotation: Option<String>,
        capture_status: bool,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let name = name.into();
        let thread_name = format!("dth-pipe-{name}");
        let pump_name = name.clone();
        let handle = thread::Builder::new().name(thread_name).spawn(move || {
            pump(&pump_name, reader, &sink, annotation.as_deref(), capture_status)
        })?;
        Ok(Self { name, handle })
    }

    /// Wait for end of stream; returns the captured status line, if any.
    pub fn join(self) -> Option<String> {
        match self.handle.join() {
            Ok(status) => status,
            Err(_) => {
                warn!(pipe = %self.name, "pipe thread panicked");
                None
            }
        }
    }
}

fn pump<R: Read>(
    name: &str,
    reader: R,
    sink: &OutputSink,
    annotation: Option<&str>,
    capture_status: bool,
) -> Option<String> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut status = None;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if capture_status && line.starts_with(STATUS_PREFIX) {
                    status = Some(line.to_string());
                    continue;
                }
                if let Err(e) = sink.write_line(annotation, line) {
                    warn!(pipe = name, error = %e, "failed to forward output");
                }
            }
            Err(e) => {
                trace!(pipe = name, error = %e, "pipe closed");
                break;
            }
        }
    }
    status
}
