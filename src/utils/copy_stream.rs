use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;

/// Fixed signature opening every binary COPY stream.
pub const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// What the first tuple slot of a binary COPY stream holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamShape {
    /// Header directly followed by the `-1` trailer: no rows.
    Empty,
    /// At least one tuple follows the header.
    HasRows,
}

/// Inspect a gzip-compressed binary COPY stream.
pub fn inspect_gzip(path: &Path) -> io::Result<StreamShape> {
    let file = File::open(path)?;
    inspect(MultiGzDecoder::new(BufReader::new(file)))
}

/// Read the header and the first 16-bit field count; a count of -1 is the
/// end-of-data marker.
pub fn inspect<R: Read>(mut reader: R) -> io::Result<StreamShape> {
    let mut signature = [0u8; 11];
    reader.read_exact(&mut signature)?;
    if &signature != SIGNATURE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing binary COPY signature",
        ));
    }

    let mut word = [0u8; 4];
    reader.read_exact(&mut word)?; // flags
    reader.read_exact(&mut word)?;
    let extension_len = u32::from_be_bytes(word) as u64;
    let skipped = io::copy(&mut (&mut reader).take(extension_len), &mut io::sink())?;
    if skipped != extension_len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }

    let mut count = [0u8; 2];
    reader.read_exact(&mut count)?;
    if i16::from_be_bytes(count) == -1 {
        Ok(StreamShape::Empty)
    } else {
        Ok(StreamShape::HasRows)
    }
}
