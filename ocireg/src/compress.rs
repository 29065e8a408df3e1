use std::io::{Cursor, Read};

use crate::errors::{Error, Result};

/// Compression type of a byte stream, detected from its leading magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Bzip2,
    Gzip,
    Xz,
    Zstd,
}

const MAGIC_BZIP2: &[u8] = &[0x42, 0x5A, 0x68];
const MAGIC_GZIP: &[u8] = &[0x1F, 0x8B, 0x08];
const MAGIC_XZ: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const MAGIC_ZSTD: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];

// longest magic we ever need to see; a stream shorter than the magic it
// would have matched is treated as uncompressed
pub const PEEK_LEN: usize = 10;

impl Compression {
    pub fn detect(head: &[u8]) -> Compression {
        if head.starts_with(MAGIC_BZIP2) {
            Compression::Bzip2
        } else if head.starts_with(MAGIC_GZIP) {
            Compression::Gzip
        } else if head.starts_with(MAGIC_XZ) {
            Compression::Xz
        } else if head.starts_with(MAGIC_ZSTD) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Compression::None => "none",
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        };
        write!(f, "{}", s)
    }
}

pub type BoxRead = Box<dyn Read + Send>;

// pull up to PEEK_LEN bytes so detection can look at the head, then stitch
// them back in front of the rest of the stream
fn peek(mut r: impl Read + Send + 'static) -> std::io::Result<(Compression, BoxRead)> {
    let mut buf = [0u8; PEEK_LEN];
    let mut n = 0;
    while n < PEEK_LEN {
        let got = r.read(&mut buf[n..])?;
        if got == 0 {
            break;
        }
        n += got;
    }
    let kind = Compression::detect(&buf[..n]);
    let rejoined: BoxRead = Box::new(Cursor::new(buf[..n].to_vec()).chain(r));
    Ok((kind, rejoined))
}

fn decoder(kind: Compression, r: BoxRead) -> std::io::Result<BoxRead> {
    Ok(match kind {
        Compression::None => r,
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(r)),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(r)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(r)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(r)?),
    })
}

/// Wrap a reader with the decoder its magic calls for; unknown or short
/// streams come back unchanged (buffered through the peek).
pub fn decompress(r: impl Read + Send + 'static) -> Result<BoxRead> {
    let (kind, rejoined) = peek(r)?;
    Ok(decoder(kind, rejoined)?)
}

/// Re-encode a stream as `target`. Input already in the target encoding is
/// passed through; anything else is decompressed first. The returned reader
/// is lazy: encoding happens as the caller pulls. Bzip2 output is not
/// supported.
pub fn compress(r: impl Read + Send + 'static, target: Compression) -> Result<BoxRead> {
    if target == Compression::Bzip2 {
        return Err(Error::NotImplemented("bzip2 compression".into()));
    }
    let (kind, rejoined) = peek(r)?;
    if kind == target {
        return Ok(rejoined);
    }
    let plain = decoder(kind, rejoined)?;
    Ok(match target {
        Compression::None => plain,
        Compression::Gzip => Box::new(flate2::read::GzEncoder::new(
            plain,
            flate2::Compression::default(),
        )),
        Compression::Xz => Box::new(xz2::read::XzEncoder::new(plain, 6)),
        Compression::Zstd => Box::new(zstd::stream::read::Encoder::new(plain, 0)?),
        Compression::Bzip2 => unreachable!(),
    })
}
