//! Content frame codec.
//!
//! A frame is `[u32 big-endian length][UTF-8 JSON region map][page data]`.
//! The region map covers exactly `length` bytes; everything after it is opaque
//! page data and is never interpreted.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

/// Frozen region id → outer markup.
pub type RegionMap = BTreeMap<String, String>;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFrame {
    pub regions: RegionMap,
    pub page_data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("content frame truncated: {len} bytes, need at least {LENGTH_PREFIX}")]
    Truncated { len: usize },
    #[error("declared region map length {declared} exceeds remaining {available} bytes")]
    LengthExceedsFrame { declared: usize, available: usize },
    #[error("region map is {len} bytes, larger than a u32 length prefix can describe")]
    RegionMapTooLarge { len: usize },
    #[error("region map is not a JSON string map: {0}")]
    InvalidRegionMap(#[from] serde_json::Error),
}

/// Serialize `regions` and append `page_data` verbatim.
pub fn encode(regions: &RegionMap, page_data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(regions)?;
    let len = u32::try_from(json.len())
        .map_err(|_| FrameError::RegionMapTooLarge { len: json.len() })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + json.len() + page_data.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    frame.extend_from_slice(page_data);
    Ok(frame)
}

/// Decode a frame, copying exactly the trailing page data range.
pub fn decode(frame: &[u8]) -> Result<ContentFrame, FrameError> {
    let (regions, data_start) = split_header(frame)?;
    Ok(ContentFrame {
        regions,
        page_data: frame[data_start..].to_vec(),
    })
}

/// Zero-copy variant of [`decode`]; the returned page data shares `frame`'s allocation.
pub fn decode_bytes(frame: Bytes) -> Result<(RegionMap, Bytes), FrameError> {
    let (regions, data_start) = split_header(&frame)?;
    Ok((regions, frame.slice(data_start..)))
}

fn split_header(frame: &[u8]) -> Result<(RegionMap, usize), FrameError> {
    let Some(prefix) = frame.first_chunk::<LENGTH_PREFIX>() else {
        return Err(FrameError::Truncated { len: frame.len() });
    };
    let declared = u32::from_be_bytes(*prefix) as usize;
    let available = frame.len() - LENGTH_PREFIX;
    if declared > available {
        return Err(FrameError::LengthExceedsFrame {
            declared,
            available,
        });
    }

    let end = LENGTH_PREFIX + declared;
    let regions: RegionMap = serde_json::from_slice(&frame[LENGTH_PREFIX..end])?;
    Ok((regions, end))
}
