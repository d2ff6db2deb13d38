//! Draw distinct values from `1..=R` without replacement, driven by hardware
//! entropy.
//!
//! # Algorithm
//!
//! The working buffer starts as the identity set `{1..R}`. Each round pulls one
//! fresh 32-bit word per remaining slot, maps it to `word % remaining`, and
//! claims that slot if nobody claimed it earlier in the round (claimed slots
//! hold the sentinel `0`). After the sweep the survivors are compacted into the
//! second buffer and the two buffers swap. Because claimed slots leave the pool
//! at the end of every round, later rounds never waste draws on them, so the
//! cost stays close to a coupon-collector process instead of degrading
//! quadratically as the pool drains.

use log::trace;

use crate::error::{Error, Result};
use crate::source::EntropyReader;

/// Marks a slot claimed during the current round. Never a valid output.
const CLAIMED: u32 = 0;

/// Unique-sequence sampler over the range `1..=R`.
///
/// Each instance owns its buffers; two samplers never share state.
#[derive(Debug)]
pub struct UniqueSequenceSampler {
    range: u32,
    active: Vec<u32>,
    spare: Vec<u32>,
    /// Live entries in `active`.
    remaining: usize,
    /// Values emitted by the current `generate` call.
    cursor: usize,
}

impl UniqueSequenceSampler {
    /// Allocate both working buffers for range `1..=range`.
    pub fn new(range: u32) -> Result<Self> {
        if range == 0 {
            return Err(Error::RangeExceeded { size: 0, range: 0 });
        }
        let slots = range as usize;
        let mut active = Vec::new();
        let mut spare = Vec::new();
        active
            .try_reserve_exact(slots)
            .and_then(|()| spare.try_reserve_exact(slots))
            .map_err(|_| Error::AllocationFailure { requested: slots })?;

        let mut sampler = Self {
            range,
            active,
            spare,
            remaining: 0,
            cursor: 0,
        };
        sampler.reset();
        Ok(sampler)
    }

    pub fn range(&self) -> u32 {
        self.range
    }

    /// Values emitted by the most recent `generate` call.
    pub fn emitted(&self) -> usize {
        self.cursor
    }

    fn reset(&mut self) {
        self.active.clear();
        self.active.extend(1..=self.range);
        self.spare.clear();
        self.remaining = self.active.len();
        self.cursor = 0;
    }

    /// Produce `size` distinct values from `1..=R`, in draw order.
    ///
    /// Every call starts again from the full range.
    pub fn generate<R: EntropyReader + ?Sized>(
        &mut self,
        size: usize,
        source: &mut R,
    ) -> Result<Vec<u32>> {
        if size > self.range as usize {
            return Err(Error::RangeExceeded {
                size,
                range: self.range as usize,
            });
        }
        self.reset();

        let mut output = Vec::with_capacity(size);
        let mut rounds = 0u32;
        while self.cursor < size && self.remaining > 0 {
            let words = source.read_words(self.remaining)?;
            for word in words {
                let idx = word as usize % self.remaining;
                let value = self.active[idx];
                if value != CLAIMED {
                    output.push(value);
                    self.active[idx] = CLAIMED;
                    self.cursor += 1;
                    if self.cursor == size {
                        break;
                    }
                }
            }
            self.compact();
            rounds += 1;
        }
        trace!("sampled {size} of {} in {rounds} rounds", self.range);
        Ok(output)
    }

    /// Move unclaimed entries into the spare buffer and swap roles.
    fn compact(&mut self) {
        self.spare.clear();
        self.spare.extend(
            self.active[..self.remaining]
                .iter()
                .copied()
                .filter(|&v| v != CLAIMED),
        );
        std::mem::swap(&mut self.active, &mut self.spare);
        self.remaining = self.active.len();
    }
}

/// One-shot helper: `size` distinct values from `1..=range`.
pub fn sample<R: EntropyReader + ?Sized>(range: u32, size: usize, source: &mut R) -> Result<Vec<u32>> {
    if size > range as usize {
        return Err(Error::RangeExceeded {
            size,
            range: range as usize,
        });
    }
    UniqueSequenceSampler::new(range)?.generate(size, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::collections::HashSet;

    struct SeededSource {
        rng: StdRng,
        bytes_read: usize,
    }

    impl SeededSource {
        fn new(seed: u64) -> Self {
            Self {
                rng: StdRng::seed_from_u64(seed),
                bytes_read: 0,
            }
        }
    }

    impl EntropyReader for SeededSource {
        fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()> {
            self.rng.fill_bytes(buf);
            self.bytes_read += buf.len();
            Ok(())
        }
    }

    /// Always returns the same word: the worst case for collisions.
    struct ConstantSource;

    impl EntropyReader for ConstantSource {
        fn read_entropy(&mut self, buf: &mut [u8]) -> Result<()> {
            buf.fill(0);
            Ok(())
        }
    }

    struct FailingSource;

    impl EntropyReader for FailingSource {
        fn read_entropy(&mut self, _buf: &mut [u8]) -> Result<()> {
            Err(Error::Timeout { partial: 0 })
        }
    }

    fn assert_unique_in_range(values: &[u32], range: u32) {
        let set: HashSet<_> = values.iter().copied().collect();
        assert_eq!(set.len(), values.len(), "duplicates in {values:?}");
        assert!(values.iter().all(|&v| (1..=range).contains(&v)));
    }

    #[test]
    fn full_range_is_a_permutation() {
        let mut src = SeededSource::new(1);
        let mut out = sample(10, 10, &mut src).unwrap();
        out.sort_unstable();
        assert_eq!(out, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn partial_draw_is_distinct() {
        let mut src = SeededSource::new(2);
        let out = sample(5, 3, &mut src).unwrap();
        assert_eq!(out.len(), 3);
        assert_unique_in_range(&out, 5);
    }

    #[test]
    fn many_ranges_and_sizes() {
        let mut src = SeededSource::new(3);
        for range in [1u32, 2, 3, 7, 64, 100, 1000] {
            let mut sampler = UniqueSequenceSampler::new(range).unwrap();
            for size in [0, 1, range as usize / 2, range as usize] {
                let out = sampler.generate(size, &mut src).unwrap();
                assert_eq!(out.len(), size);
                assert_eq!(sampler.emitted(), size);
                assert_unique_in_range(&out, range);
            }
        }
    }

    #[test]
    fn zero_size_consumes_no_entropy() {
        let mut src = SeededSource::new(4);
        let mut sampler = UniqueSequenceSampler::new(50).unwrap();
        assert!(sampler.generate(0, &mut src).unwrap().is_empty());
        assert_eq!(src.bytes_read, 0);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut src = SeededSource::new(5);
        let mut sampler = UniqueSequenceSampler::new(4).unwrap();
        assert!(matches!(
            sampler.generate(5, &mut src),
            Err(Error::RangeExceeded { size: 5, range: 4 })
        ));
        assert!(matches!(
            sample(4, 5, &mut src),
            Err(Error::RangeExceeded { .. })
        ));
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(matches!(
            UniqueSequenceSampler::new(0),
            Err(Error::RangeExceeded { .. })
        ));
    }

    #[test]
    fn constant_source_still_terminates() {
        // Word 0 always hits slot 0, so each round claims exactly one value.
        let mut sampler = UniqueSequenceSampler::new(20).unwrap();
        let out = sampler.generate(20, &mut ConstantSource).unwrap();
        assert_eq!(out, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn calls_are_not_cumulative() {
        let mut src = SeededSource::new(6);
        let mut sampler = UniqueSequenceSampler::new(8).unwrap();
        for _ in 0..5 {
            let mut out = sampler.generate(8, &mut src).unwrap();
            out.sort_unstable();
            assert_eq!(out, (1..=8).collect::<Vec<_>>());
        }
    }

    #[test]
    fn source_errors_propagate() {
        let mut sampler = UniqueSequenceSampler::new(8).unwrap();
        assert!(matches!(
            sampler.generate(3, &mut FailingSource),
            Err(Error::Timeout { .. })
        ));
        // The sampler is still usable afterwards.
        let mut src = SeededSource::new(7);
        assert_eq!(sampler.generate(3, &mut src).unwrap().len(), 3);
    }

    #[test]
    fn entropy_use_is_near_linear() {
        let mut src = SeededSource::new(8);
        let range = 10_000u32;
        sample(range, range as usize, &mut src).unwrap();
        let words = src.bytes_read / 4;
        // With compaction a full draw needs about 1.6 R words.
        assert!(words < 20 * range as usize, "used {words} words");
    }

    #[test]
    fn independent_instances_in_parallel() {
        let handles: Vec<_> = (0..4u64)
            .map(|seed| {
                std::thread::spawn(move || {
                    let mut src = SeededSource::new(100 + seed);
                    let mut sampler = UniqueSequenceSampler::new(500).unwrap();
                    (0..20)
                        .map(|_| sampler.generate(500, &mut src).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            for mut out in handle.join().unwrap() {
                out.sort_unstable();
                assert_eq!(out, (1..=500).collect::<Vec<_>>());
            }
        }
    }
}
