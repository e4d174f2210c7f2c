//! Reverse-block tail reader.
//!
//! The signal log and the bar CSV can grow without bound; every consumer
//! reads only the last N lines, seeking from EOF in fixed-size blocks.
//! Iterating from the beginning of the file each tick is not acceptable.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const BLOCK: u64 = 8192;

/// Read the last `n` lines of `path`.
///
/// Missing file yields an empty vec (callers treat that as "no data yet").
/// Other I/O errors propagate.
pub fn read_tail_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut end = file.seek(SeekFrom::End(0))?;
    let mut buf: Vec<u8> = Vec::new();

    while end > 0 && count_newlines(&buf) <= n {
        let step = BLOCK.min(end);
        end -= step;
        file.seek(SeekFrom::Start(end))?;
        let mut block = vec![0u8; step as usize];
        file.read_exact(&mut block)?;
        block.extend_from_slice(&buf);
        buf = block;
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

fn count_newlines(buf: &[u8]) -> usize {
    buf.iter().filter(|&&b| b == b'\n').count()
}
