/*!
Per-page compression codecs of the compressed dump format.
*/

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;
use smallvec::SmallVec;

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};

pub const DUMP_DH_COMPRESSED_ZLIB: u32 = 0x1;
pub const DUMP_DH_COMPRESSED_LZO: u32 = 0x2;
pub const DUMP_DH_COMPRESSED_SNAPPY: u32 = 0x4;

/// A page codec, listed in the order they are tried.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Codec {
    Zlib,
    Lzo,
    Snappy,
}

impl Codec {
    /// Flag value stored in page descriptors and the header status.
    pub fn flag(self) -> u32 {
        match self {
            Codec::Zlib => DUMP_DH_COMPRESSED_ZLIB,
            Codec::Lzo => DUMP_DH_COMPRESSED_LZO,
            Codec::Snappy => DUMP_DH_COMPRESSED_SNAPPY,
        }
    }

    pub fn from_flag(flags: u32) -> Option<Self> {
        if flags & DUMP_DH_COMPRESSED_ZLIB != 0 {
            Some(Codec::Zlib)
        } else if flags & DUMP_DH_COMPRESSED_LZO != 0 {
            Some(Codec::Lzo)
        } else if flags & DUMP_DH_COMPRESSED_SNAPPY != 0 {
            Some(Codec::Snappy)
        } else {
            None
        }
    }

    /// Returns true if this build carries the codec.
    pub fn is_available(self) -> bool {
        match self {
            Codec::Zlib => true,
            Codec::Lzo => cfg!(feature = "lzo"),
            Codec::Snappy => cfg!(feature = "snappy"),
        }
    }

    pub fn compress(self, page: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Zlib => {
                let mut enc = ZlibEncoder::new(Vec::with_capacity(page.len()), Compression::fast());
                enc.write_all(page)
                    .and_then(|_| enc.finish())
                    .map_err(|e| Error(ErrorOrigin::Compression, ErrorKind::UnableToCompress).log_error(e))
            }
            Codec::Lzo => lzo_compress(page),
            Codec::Snappy => snappy_compress(page),
        }
    }

    pub fn decompress(self, data: &[u8], page_size: usize) -> Result<Vec<u8>> {
        let out = match self {
            Codec::Zlib => {
                let mut out = Vec::with_capacity(page_size);
                ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error(ErrorOrigin::Compression, ErrorKind::UnableToDecompress).log_error(e))?;
                out
            }
            Codec::Lzo => lzo_decompress(data, page_size)?,
            Codec::Snappy => snappy_decompress(data)?,
        };
        if out.len() != page_size {
            return Err(Error(ErrorOrigin::Compression, ErrorKind::UnableToDecompress).log_error(format!(
                "{} page decompressed to {} bytes instead of {}",
                self,
                out.len(),
                page_size
            )));
        }
        Ok(out)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Codec::Zlib => "zlib",
            Codec::Lzo => "lzo",
            Codec::Snappy => "snappy",
        })
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zlib" | "c" => Ok(Codec::Zlib),
            "lzo" | "l" => Ok(Codec::Lzo),
            "snappy" | "p" => Ok(Codec::Snappy),
            _ => Err(Error(ErrorOrigin::Args, ErrorKind::UnsupportedCodec).log_error(s)),
        }
    }
}

#[cfg(feature = "lzo")]
fn lzo_compress(page: &[u8]) -> Result<Vec<u8>> {
    lzokay_native::compress(page)
        .map_err(|e| Error(ErrorOrigin::Compression, ErrorKind::UnableToCompress).log_error(format!("{:?}", e)))
}

#[cfg(feature = "lzo")]
fn lzo_decompress(data: &[u8], page_size: usize) -> Result<Vec<u8>> {
    lzokay_native::decompress_all(data, Some(page_size))
        .map_err(|e| Error(ErrorOrigin::Compression, ErrorKind::UnableToDecompress).log_error(format!("{:?}", e)))
}

#[cfg(not(feature = "lzo"))]
fn lzo_compress(_page: &[u8]) -> Result<Vec<u8>> {
    Err(Error(ErrorOrigin::Compression, ErrorKind::UnsupportedCodec).log_debug("built without lzo"))
}

#[cfg(not(feature = "lzo"))]
fn lzo_decompress(_data: &[u8], _page_size: usize) -> Result<Vec<u8>> {
    Err(Error(ErrorOrigin::Compression, ErrorKind::UnsupportedCodec).log_error("built without lzo"))
}

#[cfg(feature = "snappy")]
fn snappy_compress(page: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(page)
        .map_err(|e| Error(ErrorOrigin::Compression, ErrorKind::UnableToCompress).log_error(e))
}

#[cfg(feature = "snappy")]
fn snappy_decompress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| Error(ErrorOrigin::Compression, ErrorKind::UnableToDecompress).log_error(e))
}

#[cfg(not(feature = "snappy"))]
fn snappy_compress(_page: &[u8]) -> Result<Vec<u8>> {
    Err(Error(ErrorOrigin::Compression, ErrorKind::UnsupportedCodec).log_debug("built without snappy"))
}

#[cfg(not(feature = "snappy"))]
fn snappy_decompress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error(ErrorOrigin::Compression, ErrorKind::UnsupportedCodec).log_error("built without snappy"))
}

/// The set of codecs enabled for one dump.
#[derive(Clone, Debug, Default)]
pub struct PageCompressor {
    codecs: SmallVec<[Codec; 3]>,
}

impl PageCompressor {
    /// Enables the codecs in `requested` that this build supports.
    ///
    /// Codecs are always tried zlib first, then lzo, then snappy.
    pub fn new(requested: &[Codec]) -> Self {
        let mut codecs: SmallVec<[Codec; 3]> = SmallVec::new();
        for &codec in requested {
            if !codec.is_available() {
                debug!("{} compression is not available in this build, skipping it", codec);
            } else if !codecs.contains(&codec) {
                codecs.push(codec);
            }
        }
        codecs.sort();
        Self { codecs }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.codecs.is_empty()
    }

    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    /// Header status bits: the first enabled codec.
    pub fn status_flag(&self) -> u32 {
        self.codecs.first().map(|c| c.flag()).unwrap_or(0)
    }

    /// Compresses `page` with the first codec whose output is strictly
    /// smaller than the page.
    ///
    /// Returns `None` if the page has to be stored raw.
    pub fn compress(&self, page: &[u8]) -> Result<Option<(Codec, Vec<u8>)>> {
        for &codec in self.codecs.iter() {
            let out = codec.compress(page)?;
            if out.len() < page.len() {
                return Ok(Some((codec, out)));
            }
        }
        Ok(None)
    }
}
