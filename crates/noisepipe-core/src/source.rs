//! Byte-stream abstraction over anything that produces entropy.
//!
//! The sampler and other library consumers only need a [`EntropyReader`]: a
//! local [`EntropyDevice`](crate::device::EntropyDevice) and a broker client are
//! interchangeable behind it.

use crate::error::Result;

/// Producer of entropy bytes.
pub trait EntropyReader {
    /// Fill `buf` completely or fail.
    fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Read `n` little-endian 32-bit words.
    fn read_words(&mut self, n: usize) -> Result<Vec<u32>> {
        let mut bytes = vec![0u8; n * 4];
        self.read_entropy(&mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

impl<R: EntropyReader + ?Sized> EntropyReader for &mut R {
    fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read_entropy(buf)
    }
}

impl<R: EntropyReader + ?Sized> EntropyReader for Box<R> {
    fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read_entropy(buf)
    }
}
