//! Read-back of Motion-JPEG AVI (RIFF) containers.
//!
//! A muxer only turns its output into a playable file once it has appended the
//! `idx1` index and filled in the sizes and frame counts it left open while
//! streaming. `inspect` walks the chunks of a recording and reports whether that
//! happened; `read_frames` returns the JPEG payloads for decoding checks.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AviInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frame count from the main header; zero until finalized.
    pub total_frames: u32,
    /// `00dc` chunks actually present in `movi`.
    pub chunks: usize,
    pub index_entries: Option<usize>,
    /// RIFF size field agrees with the file length.
    pub riff_size_ok: bool,
}

impl AviInfo {
    pub fn is_finalized(&self) -> bool {
        self.riff_size_ok
            && self.index_entries == Some(self.chunks)
            && self.total_frames as usize == self.chunks
    }
}

pub fn inspect(path: &Path) -> Result<AviInfo> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let parsed = parse(&bytes).with_context(|| format!("parse {}", path.display()))?;
    Ok(parsed.info)
}

/// JPEG payloads of every frame, in order.
pub fn read_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let parsed = parse(&bytes).with_context(|| format!("parse {}", path.display()))?;
    Ok(parsed
        .frames
        .into_iter()
        .map(|(start, len)| bytes[start..start + len].to_vec())
        .collect())
}

struct Parsed {
    info: AviInfo,
    frames: Vec<(usize, usize)>,
}

fn parse(bytes: &[u8]) -> Result<Parsed> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"AVI " {
        return Err(anyhow!("not an AVI container"));
    }
    let riff_size = read_u32(bytes, 4)? as usize;
    let mut info = AviInfo {
        width: 0,
        height: 0,
        fps: 0,
        total_frames: 0,
        chunks: 0,
        index_entries: None,
        riff_size_ok: riff_size + 8 == bytes.len(),
    };
    let mut frames = Vec::new();

    let mut cursor = 12;
    while cursor + 8 <= bytes.len() {
        let id = &bytes[cursor..cursor + 4];
        let size = read_u32(bytes, cursor + 4)? as usize;
        let body = cursor + 8;
        match id {
            b"LIST" => {
                let kind = bytes
                    .get(body..body + 4)
                    .ok_or_else(|| anyhow!("truncated LIST at {}", cursor))?;
                match kind {
                    b"hdrl" => {
                        let end = (body + size).min(bytes.len());
                        let avih = find_chunk(bytes, body + 4, end, b"avih")
                            .ok_or_else(|| anyhow!("hdrl without avih"))?;
                        info.total_frames = read_u32(bytes, avih + 16)?;
                        info.width = read_u32(bytes, avih + 32)?;
                        info.height = read_u32(bytes, avih + 36)?;
                        // First stream is the video stream: rate / scale.
                        let strh = find_chunk(bytes, body + 4, end, b"strh")
                            .ok_or_else(|| anyhow!("hdrl without strh"))?;
                        let scale = read_u32(bytes, strh + 20)?.max(1);
                        info.fps = read_u32(bytes, strh + 24)? / scale;
                    }
                    b"movi" => {
                        // An unfinalized file still carries a zero size here.
                        let end = if size == 0 { bytes.len() } else { (body + size).min(bytes.len()) };
                        let mut chunk = body + 4;
                        while chunk + 8 <= end {
                            let len = read_u32(bytes, chunk + 4)? as usize;
                            if chunk + 8 + len > bytes.len() {
                                break;
                            }
                            if &bytes[chunk..chunk + 4] == b"00dc" {
                                frames.push((chunk + 8, len));
                            } else if size == 0 && &bytes[chunk..chunk + 4] == b"idx1" {
                                break;
                            }
                            chunk += 8 + len + (len & 1);
                        }
                        if size == 0 {
                            info.chunks = frames.len();
                            break;
                        }
                    }
                    _ => {}
                }
            }
            b"idx1" => info.index_entries = Some(size / 16),
            _ => {}
        }
        if size == 0 && id != b"LIST" {
            break;
        }
        cursor = body + size + (size & 1);
    }
    info.chunks = frames.len();
    Ok(Parsed { info, frames })
}

/// Body offset of the first `id` chunk in `start..end`, descending into lists.
fn find_chunk(bytes: &[u8], start: usize, end: usize, id: &[u8; 4]) -> Option<usize> {
    let mut cursor = start;
    while cursor + 8 <= end {
        let size = read_u32(bytes, cursor + 4).ok()? as usize;
        let body = cursor + 8;
        if &bytes[cursor..cursor + 4] == id {
            return Some(body);
        }
        if &bytes[cursor..cursor + 4] == b"LIST" {
            if let Some(found) = find_chunk(bytes, body + 4, (body + size).min(end), id) {
                return Some(found);
            }
        }
        cursor = body + size + (size & 1);
    }
    None
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| anyhow!("truncated at offset {}", at))?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}
