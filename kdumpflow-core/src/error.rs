/*!
Specialized `Error` and `Result` types for kdumpflow.
*/

use std::{error, fmt, io, result};

use log::{debug, error, info, trace, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Error(pub ErrorOrigin, pub ErrorKind);

impl Error {
    /// Returns a static string representing the type of error.
    pub fn as_str(&self) -> &'static str {
        self.1.to_str()
    }

    /// Returns a static string representing the type of error.
    pub fn into_str(self) -> &'static str {
        self.as_str()
    }

    /// Builds an error from an io error, classifying a full output device as `NoSpace`.
    pub fn from_io(origin: ErrorOrigin, kind: ErrorKind, err: &io::Error) -> Self {
        if is_no_space(err) {
            Error(origin, ErrorKind::NoSpace)
        } else {
            Error(origin, kind)
        }
    }

    /// Returns true if the output ran out of space.
    ///
    /// This is the only error the dump level fallback loop recovers from.
    pub fn is_no_space(&self) -> bool {
        self.1 == ErrorKind::NoSpace
    }

    /// Process exit status used by the command line tool and split workers.
    pub fn exit_code(&self) -> i32 {
        match self.1 {
            ErrorKind::NoSpace => EXIT_NOSPACE,
            ErrorKind::WorkerIncomplete => EXIT_INCOMPLETE,
            _ => EXIT_FAILURE,
        }
    }

    pub fn log_error(self, err: impl fmt::Display) -> Self {
        error!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_warn(self, err: impl fmt::Display) -> Self {
        warn!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_info(self, err: impl fmt::Display) -> Self {
        info!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_debug(self, err: impl fmt::Display) -> Self {
        debug!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }

    pub fn log_trace(self, err: impl fmt::Display) -> Self {
        trace!("{}: {} ({})", self.0.to_str(), self.1.to_str(), err);
        self
    }
}

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOSPACE: i32 = 2;
pub const EXIT_INCOMPLETE: i32 = 3;

const ENOSPC: i32 = 28;

/// Returns true if the io error reports a full device.
pub fn is_no_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ENOSPC)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.0.to_str(), self.1.to_str())
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        self.as_str()
    }
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorOrigin {
    Args,
    Config,

    Source,
    Layout,
    MemoryMap,

    Classifier,
    FreeList,
    Bitmap,
    Cycle,

    DumpFile,
    Compression,
    Flattened,
    Split,
    Reassemble,

    Other,
}

impl ErrorOrigin {
    /// Returns a static string representing the type of error.
    pub fn to_str(self) -> &'static str {
        match self {
            ErrorOrigin::Args => "args",
            ErrorOrigin::Config => "config",

            ErrorOrigin::Source => "source memory",
            ErrorOrigin::Layout => "kernel layout",
            ErrorOrigin::MemoryMap => "memory map",

            ErrorOrigin::Classifier => "page classifier",
            ErrorOrigin::FreeList => "free list",
            ErrorOrigin::Bitmap => "bitmap",
            ErrorOrigin::Cycle => "cycle",

            ErrorOrigin::DumpFile => "dump file",
            ErrorOrigin::Compression => "compression",
            ErrorOrigin::Flattened => "flattened format",
            ErrorOrigin::Split => "split",
            ErrorOrigin::Reassemble => "reassemble",

            ErrorOrigin::Other => "other",
        }
    }
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Uninitialized,
    NotSupported,
    Configuration,

    ArgValidation,
    InvalidDumpLevel,
    ConflictingOptions,

    NotFound,
    OutOfBounds,
    Encoding,

    UnableToOpenFile,
    UnableToReadFile,
    UnableToWriteFile,
    UnableToSeekFile,
    UnableToMapFile,
    UnableToDeleteFile,
    NoSpace,
    Timeout,

    UnableToReadMemory,
    InvalidElfFile,
    InvalidSignature,
    InvalidHeader,
    VersionMismatch,

    MissingSymbol,
    MissingLayout,
    BrokenFreeList,
    PfnOutOfCycle,

    UnsupportedCodec,
    UnableToCompress,
    UnableToDecompress,

    WorkerFailed,
    WorkerIncomplete,
    NotContiguous,

    Unknown,
}

impl ErrorKind {
    /// Returns a static string representing the type of error.
    pub fn to_str(self) -> &'static str {
        match self {
            ErrorKind::Uninitialized => "unitialized",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Configuration => "configuration error",

            ErrorKind::ArgValidation => "the argument could not be validated",
            ErrorKind::InvalidDumpLevel => "invalid dump level",
            ErrorKind::ConflictingOptions => "options cannot be combined",

            ErrorKind::NotFound => "not found",
            ErrorKind::OutOfBounds => "out of bounds",
            ErrorKind::Encoding => "encoding error",

            ErrorKind::UnableToOpenFile => "unable to open file",
            ErrorKind::UnableToReadFile => "unable to read file",
            ErrorKind::UnableToWriteFile => "unable to write file",
            ErrorKind::UnableToSeekFile => "unable to seek file",
            ErrorKind::UnableToMapFile => "unable to map file",
            ErrorKind::UnableToDeleteFile => "unable to delete file",
            ErrorKind::NoSpace => "no space left on device",
            ErrorKind::Timeout => "timed out waiting for input",

            ErrorKind::UnableToReadMemory => "unable to read memory",
            ErrorKind::InvalidElfFile => "file is not a valid elf file",
            ErrorKind::InvalidSignature => "invalid signature",
            ErrorKind::InvalidHeader => "invalid header",
            ErrorKind::VersionMismatch => "version mismatch",

            ErrorKind::MissingSymbol => "kernel symbol not found",
            ErrorKind::MissingLayout => "structure layout entry not found",
            ErrorKind::BrokenFreeList => "free list is broken",
            ErrorKind::PfnOutOfCycle => "pfn is outside of the current cycle",

            ErrorKind::UnsupportedCodec => "compression codec is not supported",
            ErrorKind::UnableToCompress => "unable to compress page",
            ErrorKind::UnableToDecompress => "unable to decompress page",

            ErrorKind::WorkerFailed => "split worker failed",
            ErrorKind::WorkerIncomplete => "split worker did not complete",
            ErrorKind::NotContiguous => "split dump files are not contiguous",

            ErrorKind::Unknown => "unknown error",
        }
    }
}

/// Specialized `Result` type for kdumpflow results.
pub type Result<T> = result::Result<T, Error>;
