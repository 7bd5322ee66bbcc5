//! Decompression of regular (non reflink) package payloads.

use std::io::{self, BufRead, Read};

/// The compression methods a payload can use.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Compression {
    /// gzip, detected by its magic number.
    Gzip,
    /// bzip2, detected by its magic number.
    Bzip2,
    /// xz, detected by its magic number.
    Xz,
    /// Legacy lzma. The format has no reliable magic number, so it is only selected when the
    /// package names it as its payload compressor.
    Lzma,
    /// zstd, detected by its magic number.
    Zstd,
}

impl Compression {
    /// Determines the compression of a stream from its first bytes, falling back to the payload
    /// compressor named in the package headers.
    pub fn detect(prefix: &[u8], compressor: Option<&str>) -> Option<Self> {
        if prefix.starts_with(&[0x1f, 0x8b]) {
            Some(Compression::Gzip)
        } else if prefix.starts_with(b"BZh") {
            Some(Compression::Bzip2)
        } else if prefix.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(Compression::Xz)
        } else if prefix.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(Compression::Zstd)
        } else if compressor == Some("lzma") {
            Some(Compression::Lzma)
        } else {
            None
        }
    }
}

/// An error that can occur while setting up the decompression of a payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Reading the payload failed.
    #[error("an io error occurred while reading the payload")]
    IoError(#[from] io::Error),

    /// The payload is not compressed, or compressed with an unknown method.
    #[error("unsupported compression method")]
    UnsupportedCompression,
}

/// Wraps `reader` in a decoder for the compression the payload uses.
///
/// `compressor` is the payload compressor named in the package headers. If the compression cannot
/// be determined the payload is returned as is, unless `must_be_compressed` is set in which case
/// [`PayloadError::UnsupportedCompression`] is returned.
pub fn decompress<'r, R: BufRead + 'r>(
    mut reader: R,
    compressor: Option<&str>,
    must_be_compressed: bool,
) -> Result<Box<dyn Read + 'r>, PayloadError> {
    let compression = Compression::detect(reader.fill_buf()?, compressor);
    tracing::debug!("payload compression: {compression:?}");

    Ok(match compression {
        Some(Compression::Gzip) => Box::new(flate2::bufread::MultiGzDecoder::new(reader)),
        Some(Compression::Bzip2) => Box::new(bzip2::bufread::MultiBzDecoder::new(reader)),
        Some(Compression::Xz) => Box::new(xz2::bufread::XzDecoder::new_multi_decoder(reader)),
        Some(Compression::Lzma) => {
            let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX).map_err(io::Error::from)?;
            Box::new(xz2::bufread::XzDecoder::new_stream(reader, stream))
        }
        Some(Compression::Zstd) => Box::new(zstd::stream::read::Decoder::with_buffer(reader)?),
        None if must_be_compressed => return Err(PayloadError::UnsupportedCompression),
        None => Box::new(reader),
    })
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::{decompress, Compression, PayloadError};

    #[rstest]
    #[case(&[0x1f, 0x8b, 8, 0], None, Some(Compression::Gzip))]
    #[case(b"BZh91AY", Some("gzip"), Some(Compression::Bzip2))]
    #[case(&[0xfd, b'7', b'z', b'X', b'Z', 0, 0], None, Some(Compression::Xz))]
    #[case(&[0x28, 0xb5, 0x2f, 0xfd], None, Some(Compression::Zstd))]
    #[case(&[0x5d, 0, 0, 0x80], Some("lzma"), Some(Compression::Lzma))]
    #[case(&[0x5d, 0, 0, 0x80], None, None)]
    #[case(b"070701", Some("xz"), None)]
    fn test_detect(
        #[case] prefix: &[u8],
        #[case] compressor: Option<&str>,
        #[case] expected: Option<Compression>,
    ) {
        assert_eq!(Compression::detect(prefix, compressor), expected);
    }

    fn read_all(payload: &[u8], compressor: Option<&str>) -> Vec<u8> {
        let mut reader = decompress(payload, compressor, true).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_gzip() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"gzip payload").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(read_all(&compressed, Some("gzip")), b"gzip payload");
    }

    #[test]
    fn test_zstd() {
        let compressed = zstd::stream::encode_all(&b"zstd payload"[..], 3).unwrap();
        assert_eq!(read_all(&compressed, None), b"zstd payload");
    }

    #[test]
    fn test_xz() {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(b"xz payload").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(read_all(&compressed, Some("xz")), b"xz payload");
    }

    #[test]
    fn test_uncompressed() {
        assert_matches!(
            decompress(&b"070701"[..], None, true).map(|_| ()),
            Err(PayloadError::UnsupportedCompression)
        );
        let mut out = Vec::new();
        decompress(&b"070701"[..], None, false)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"070701");
    }
}
