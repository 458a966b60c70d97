//! Content fingerprint of a decompressed source archive.
//!
//! ## Why hash the decompressed .tar, not the .gz?
//!
//! gzip output depends on the compressor implementation and level, so the
//! same source re-compressed elsewhere would fingerprint differently and
//! spuriously invalidate a recorded attempt. Hashing the underlying .tar
//! stream makes the fingerprint a function of content alone.
//!
//! The hash is 128-bit MD5: change detection only, never a security
//! boundary. Every state transition in the record store compares this
//! fingerprint to decide whether a finishing attempt still corresponds to
//! the bytes currently in flight.

use flate2::read::GzDecoder;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Stream a reader through MD5 in bounded chunks and return the hex digest.
///
/// Pure: same bytes in, same hex out. The 8 KiB chunk size bounds memory
/// regardless of archive size. I/O errors propagate; there are no other
/// failure modes.
pub fn fingerprint_reader(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint a `.tar.gz` file by its decompressed content.
pub fn fingerprint_archive(path: impl AsRef<Path>) -> io::Result<String> {
    let file = File::open(path.as_ref())?;
    fingerprint_reader(GzDecoder::new(file))
}
