//! Payload chunking.
//!
//! `chunk` is a pure function from a payload and a chunk configuration to
//! an ordered list of slices. Concatenating the slices always yields the
//! original payload; every slice except the last is exactly
//! `max_chunk_bytes` long.

use config::ChunkConfig;
use error::Error;

pub fn chunk<'a>(payload: &'a [u8], cfg: &ChunkConfig) -> Result<Vec<&'a [u8]>, Error> {
    if !cfg.enable_auto() {
        return Ok(vec![payload]);
    }

    let max = cfg.max_chunk_bytes();
    if max == 0 {
        return Err(Error::ChunkConfig("maxChunkBytes must be positive".into()));
    }

    if payload.len() <= cfg.threshold() {
        return Ok(vec![payload]);
    }

    Ok(payload.chunks(max).collect())
}

#[test]
fn chunks_rejoin() {
    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
    let cfg = ChunkConfig::new(true, 1024, 300);
    let chunks = chunk(&payload, &cfg).unwrap();
    assert_eq!(chunks.len(), 7);
    for c in &chunks[..6] {
        assert_eq!(c.len(), 300);
    }
    assert_eq!(chunks[6].len(), 2048 - 6 * 300);
    let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().cloned()).collect();
    assert_eq!(rejoined, payload);
}
