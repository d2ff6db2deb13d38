//! Continuous health tests and the on-demand self-diagnostic.
//!
//! The two continuous tests follow NIST SP 800-90B §4.4 for byte-valued
//! samples, assuming a conservative min-entropy of 2 bits per raw byte:
//!
//! - **Repetition count**: fails when one value repeats `RCT_CUTOFF` times in a row.
//! - **Adaptive proportion**: fails when the first value of a 512-sample window
//!   reappears `APT_CUTOFF` times inside that window.
//!
//! Both tests carry state across blocks, so a run split between two device
//! reads is still caught.

use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::error::{Error, Result};

/// Repetition count cutoff: `1 + ceil(20 / H)` with H = 2.
pub const RCT_CUTOFF: u32 = 11;

/// Adaptive proportion window size for non-binary samples.
pub const APT_WINDOW: u32 = 512;

/// Adaptive proportion cutoff for H = 2, alpha = 2^-20.
pub const APT_CUTOFF: u32 = 177;

/// Minimum Shannon entropy (bits/byte) the self-diagnostic accepts.
pub const DIAGNOSTIC_MIN_SHANNON: f64 = 6.0;

/// Minimum zlib compression ratio the self-diagnostic accepts.
pub const DIAGNOSTIC_MIN_COMPRESSION: f64 = 0.9;

#[derive(Debug, Default, Clone)]
pub struct RepetitionCountTest {
    last: Option<u8>,
    run: u32,
}

impl RepetitionCountTest {
    pub fn feed(&mut self, sample: u8) -> bool {
        if self.last == Some(sample) {
            self.run += 1;
        } else {
            self.last = Some(sample);
            self.run = 1;
        }
        self.run < RCT_CUTOFF
    }
}

#[derive(Debug, Default, Clone)]
pub struct AdaptiveProportionTest {
    reference: u8,
    seen: u32,
    matches: u32,
}

impl AdaptiveProportionTest {
    pub fn feed(&mut self, sample: u8) -> bool {
        if self.seen == 0 {
            self.reference = sample;
            self.matches = 1;
        } else if sample == self.reference {
            self.matches += 1;
        }
        self.seen += 1;
        let ok = self.matches < APT_CUTOFF;
        if self.seen == APT_WINDOW {
            self.seen = 0;
        }
        ok
    }
}

/// Both continuous tests, fed from every raw block served to clients.
#[derive(Debug, Default, Clone)]
pub struct HealthMonitor {
    rct: RepetitionCountTest,
    apt: AdaptiveProportionTest,
    failures: u64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every byte of `block` through both tests.
    pub fn check(&mut self, block: &[u8]) -> Result<()> {
        for (i, &b) in block.iter().enumerate() {
            if !self.rct.feed(b) {
                return self.fail(format!("repetition count test at byte {i}"));
            }
            if !self.apt.feed(b) {
                return self.fail(format!("adaptive proportion test at byte {i}"));
            }
        }
        Ok(())
    }

    fn fail(&mut self, what: String) -> Result<()> {
        self.failures += 1;
        // Start over so one bad block does not poison the next.
        self.rct = RepetitionCountTest::default();
        self.apt = AdaptiveProportionTest::default();
        Err(Error::HealthTest(what))
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

// ---------------------------------------------------------------------------
// Self-diagnostic
// ---------------------------------------------------------------------------

/// Quick Shannon entropy in bits/byte for a byte slice.
pub fn quick_shannon(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let n = data.len() as f64;
    let mut h = 0.0;
    for &c in &counts {
        if c > 0 {
            let p = c as f64 / n;
            h -= p * p.log2();
        }
    }
    h
}

/// zlib compressed size divided by input size. ~1.0 for random data.
pub fn compression_ratio(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    if encoder.write_all(data).is_err() {
        return 0.0;
    }
    let compressed = encoder.finish().unwrap_or_default();
    compressed.len() as f64 / data.len() as f64
}

/// Outcome of a self-diagnostic run over one sample block.
#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub samples: usize,
    pub shannon_entropy: f64,
    pub compression_ratio: f64,
    pub repetition_ok: bool,
    pub proportion_ok: bool,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.repetition_ok
            && self.proportion_ok
            && self.shannon_entropy >= DIAGNOSTIC_MIN_SHANNON
            && self.compression_ratio >= DIAGNOSTIC_MIN_COMPRESSION
    }

    /// Status word reported to clients: 0 = pass, otherwise a bit per failed check.
    pub fn code(&self) -> u32 {
        let mut code = 0;
        if !self.repetition_ok {
            code |= 1;
        }
        if !self.proportion_ok {
            code |= 2;
        }
        if self.shannon_entropy < DIAGNOSTIC_MIN_SHANNON {
            code |= 4;
        }
        if self.compression_ratio < DIAGNOSTIC_MIN_COMPRESSION {
            code |= 8;
        }
        code
    }
}

/// Run all checks over a fresh block of raw samples.
pub fn diagnose(data: &[u8]) -> DiagnosticReport {
    let mut rct = RepetitionCountTest::default();
    let mut apt = AdaptiveProportionTest::default();
    let mut repetition_ok = true;
    let mut proportion_ok = true;
    for &b in data {
        repetition_ok &= rct.feed(b);
        proportion_ok &= apt.feed(b);
    }
    DiagnosticReport {
        samples: data.len(),
        shannon_entropy: quick_shannon(data),
        compression_ratio: compression_ratio(data),
        repetition_ok,
        proportion_ok,
    }
}
