//! Helper module to compute a CRC32 checksum

use std::io;
use std::io::prelude::*;

use crc32fast::Hasher;

/// Reader that validates the CRC32 when it reaches the EOF.
pub(crate) struct Crc32Reader<R> {
    inner: R,
    hasher: Hasher,
    check: u32,
}

impl<R> Crc32Reader<R> {
    /// Get a new Crc32Reader which checks the inner reader against checksum.
    pub(crate) fn new(inner: R, checksum: u32) -> Self {
        Crc32Reader {
            inner,
            hasher: Hasher::new(),
            check: checksum,
        }
    }

    fn check_matches(&self) -> Result<(), &'static str> {
        let res = self.hasher.clone().finalize();
        if self.check == res {
            Ok(())
        } else {
            Err("Invalid checksum")
        }
    }
}

impl<R: Read> Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        /* We want to make sure we only check the hash when the input stream is exhausted. */
        if buf.is_empty() {
            /* If the input buf is empty (this shouldn't happen, but isn't guaranteed), we
             * still want to "pull" from the source in case it surfaces an i/o error. This will
             * always return a count of Ok(0) if successful. */
            return self.inner.read(buf);
        }

        let count = self.inner.read(buf)?;
        if count == 0 {
            return self.check_matches().map(|()| 0).map_err(io::Error::other);
        }
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}
