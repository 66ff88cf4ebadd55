use brotli::{CompressorWriter, Decompressor};
use std::io::{Read, Write};

// Mid-range quality: cache writes sit on the request path.
const QUALITY: u32 = 5;
const LG_WINDOW: u32 = 22;

pub fn compress(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut compressed = Vec::new();
    let mut compressor = CompressorWriter::new(&mut compressed, 4096, QUALITY, LG_WINDOW);
    compressor.write_all(input)?;
    compressor.flush()?;
    drop(compressor);
    Ok(compressed)
}

pub fn decompress(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    let mut decompressor = Decompressor::new(input, 4096);
    decompressor.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_text_is_smaller_and_restorable() {
        let input = "model-search-result ".repeat(200);
        let packed = compress(input.as_bytes()).unwrap();
        assert!(packed.len() < input.len());
        assert_eq!(decompress(&packed).unwrap(), input.as_bytes());
    }

    #[test]
    fn garbage_fails_to_decompress() {
        assert!(decompress(b"\xff\xfenot brotli at all").is_err());
    }
}
