/*!
The flattened format: a dump file serialized into a stream of
`(offset, size, data)` records so it can be written to a pipe and rebuilt
later by seeking to every offset.

All record fields are big-endian.
*/

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

use super::cache::DumpSink;

pub const MAKEDUMPFILE_SIGNATURE: &[u8] = b"makedumpfile";
pub const SIG_LEN_MDF: usize = 16;
pub const TYPE_FLAT_HEADER: i64 = 1;
pub const VERSION_FLAT_HEADER: i64 = 1;
pub const SIZE_FLAT_HEADER: usize = 4096;
pub const END_FLAG_FLAT_HEADER: i64 = -1;

/// Longest time the rearrange reader waits for input.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(600);

const SIZE_DATA_HEADER: usize = 16;
const READ_CHUNK: usize = 64 * 1024;

fn preamble() -> Vec<u8> {
    let mut out = vec![0u8; SIZE_FLAT_HEADER];
    out[..MAKEDUMPFILE_SIGNATURE.len()].copy_from_slice(MAKEDUMPFILE_SIGNATURE);
    out[SIG_LEN_MDF..SIG_LEN_MDF + 8].copy_from_slice(&TYPE_FLAT_HEADER.to_be_bytes());
    out[SIG_LEN_MDF + 8..SIG_LEN_MDF + 16].copy_from_slice(&VERSION_FLAT_HEADER.to_be_bytes());
    out
}

fn data_header(offset: i64, size: i64) -> [u8; SIZE_DATA_HEADER] {
    let mut out = [0u8; SIZE_DATA_HEADER];
    out[..8].copy_from_slice(&offset.to_be_bytes());
    out[8..].copy_from_slice(&size.to_be_bytes());
    out
}

/// A dump sink emitting the flattened format, e.g. to standard output.
pub struct FlatSink<W: Write> {
    out: W,
    records: u64,
}

impl<W: Write> FlatSink<W> {
    /// Writes the preamble and returns the sink.
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(&preamble()).map_err(|e| {
            Error::from_io(ErrorOrigin::Flattened, ErrorKind::UnableToWriteFile, &e)
                .log_error(format!("unable to write the flattened header: {}", e))
        })?;
        Ok(Self { out, records: 0 })
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, offset: i64, size: i64, data: &[u8]) -> Result<()> {
        self.out
            .write_all(&data_header(offset, size))
            .and_then(|_| self.out.write_all(data))
            .map_err(|e| {
                Error::from_io(ErrorOrigin::Flattened, ErrorKind::UnableToWriteFile, &e)
                    .log_error(format!("record of {} bytes at {:x}: {}", data.len(), offset, e))
            })
    }
}

impl<W: Write> DumpSink for FlatSink<W> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.records += 1;
        self.emit(offset as i64, data.len() as i64, data)
    }

    fn finish(&mut self) -> Result<()> {
        self.emit(END_FLAG_FLAT_HEADER, END_FLAG_FLAT_HEADER, &[])?;
        debug!("flattened output: {} records", self.records);
        self.out.flush().map_err(|e| {
            Error::from_io(ErrorOrigin::Flattened, ErrorKind::UnableToWriteFile, &e).log_error(e)
        })
    }
}

/// A reader that fails when its input does not deliver data for `timeout`.
///
/// The input is drained by a helper thread.
pub struct StallReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    timeout: Duration,
    eof: bool,
}

impl StallReader {
    pub fn new<R: Read + Send + 'static>(mut input: R, timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(4);
        thread::Builder::new()
            .name("flat-input".to_string())
            .spawn(move || loop {
                let mut chunk = vec![0u8; READ_CHUNK];
                match input.read(&mut chunk) {
                    Ok(0) => {
                        let _ = tx.send(Ok(Vec::new()));
                        break;
                    }
                    Ok(n) => {
                        chunk.truncate(n);
                        if tx.send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            })
            .map_err(|e| {
                Error::from_io(ErrorOrigin::Flattened, ErrorKind::UnableToReadFile, &e)
                    .log_error(format!("unable to start the input thread: {}", e))
            })?;
        Ok(Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
            timeout,
            eof: false,
        })
    }
}

impl Read for StallReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            if self.eof {
                return Ok(0);
            }
            match self.rx.recv_timeout(self.timeout) {
                Ok(Ok(chunk)) => {
                    self.eof = chunk.is_empty();
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no input data"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.eof = true;
                }
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn read_input<R: Read>(input: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    input.read_exact(buf).map_err(|e| {
        let kind = match e.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::UnableToReadFile,
        };
        Error(ErrorOrigin::Flattened, kind).log_error(format!("{}: {}", what, e))
    })
}

/// Rebuilds a dump file from a flattened stream.
///
/// Returns the number of data records applied.
pub fn rearrange<R: Read, K: DumpSink + ?Sized>(mut input: R, sink: &mut K) -> Result<u64> {
    let mut header = vec![0u8; SIZE_FLAT_HEADER];
    read_input(&mut input, &mut header, "flattened header")?;

    if &header[..MAKEDUMPFILE_SIGNATURE.len()] != MAKEDUMPFILE_SIGNATURE {
        return Err(Error(ErrorOrigin::Flattened, ErrorKind::InvalidSignature)
            .log_error("input is not in the flattened format"));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&header[SIG_LEN_MDF..SIG_LEN_MDF + 8]);
    let ty = i64::from_be_bytes(word);
    word.copy_from_slice(&header[SIG_LEN_MDF + 8..SIG_LEN_MDF + 16]);
    let version = i64::from_be_bytes(word);
    if ty != TYPE_FLAT_HEADER || version != VERSION_FLAT_HEADER {
        return Err(Error(ErrorOrigin::Flattened, ErrorKind::VersionMismatch)
            .log_error(format!("type {} version {}", ty, version)));
    }

    let mut records = 0;
    let mut buf = Vec::new();
    loop {
        let mut dh = [0u8; SIZE_DATA_HEADER];
        read_input(&mut input, &mut dh, "record header")?;
        word.copy_from_slice(&dh[..8]);
        let offset = i64::from_be_bytes(word);
        word.copy_from_slice(&dh[8..]);
        let size = i64::from_be_bytes(word);

        if offset == END_FLAG_FLAT_HEADER && size == END_FLAG_FLAT_HEADER {
            break;
        }
        if offset < 0 || size < 0 {
            return Err(Error(ErrorOrigin::Flattened, ErrorKind::InvalidHeader)
                .log_error(format!("record offset {} size {}", offset, size)));
        }

        buf.resize(size as usize, 0);
        read_input(&mut input, &mut buf, "record data")?;
        sink.write_at(offset as u64, &buf)?;
        records += 1;
    }

    info!("rearranged {} records", records);
    Ok(records)
}
