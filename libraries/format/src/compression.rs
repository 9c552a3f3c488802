use crate::error::{FormatError, Result};

/// Decompresses a chunk payload according to its `compression` header tag.
///
/// `none` (or an empty tag) passes the bytes through; `lz4` runs the LZ4
/// block algorithm and must yield exactly `decompressed_size` bytes.
pub fn decompress(tag: &str, data: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
    match tag {
        "" | "none" => Ok(data.to_vec()),
        "lz4" => {
            let out = lz4_flex::decompress(data, decompressed_size)
                .map_err(|err| FormatError::Decompression(err.to_string()))?;
            if out.len() != decompressed_size {
                return Err(FormatError::Decompression(format!(
                    "expected {decompressed_size} bytes, got {}",
                    out.len()
                )));
            }
            Ok(out)
        }
        other => Err(FormatError::UnsupportedCompression(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_passes_through() {
        assert_eq!(decompress("none", b"abc", 3).unwrap(), b"abc");
    }

    #[test]
    fn lz4_round_trip() {
        let payload: Vec<u8> = (0..64u8).cycle().take(4096).collect();
        let compressed = lz4_flex::compress(&payload);
        assert_eq!(decompress("lz4", &compressed, payload.len()).unwrap(), payload);
    }

    #[test]
    fn lz4_size_mismatch_fails() {
        let compressed = lz4_flex::compress(b"hello world");
        assert!(matches!(
            decompress("lz4", &compressed, 5),
            Err(FormatError::Decompression(_))
        ));
    }

    #[test]
    fn unknown_tag_fails() {
        assert!(matches!(
            decompress("bz2", b"", 0),
            Err(FormatError::UnsupportedCompression(tag)) if tag == "bz2"
        ));
    }
}
