//! Checksum utilities for shoal
//!
//! Objects carry a `(type, value)` checksum pair; the calculator streams so
//! that PUT and cold-GET paths can hash while writing the workfile.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use xxhash_rust::xxh64::Xxh64;

/// Supported checksum algorithms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CksumType {
    None,
    #[default]
    Xxhash64,
    Sha256,
}

impl CksumType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Xxhash64 => "xxhash64",
            Self::Sha256 => "sha256",
        }
    }

    /// Parse from a header value; unknown types degrade to `None`
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "xxhash64" => Self::Xxhash64,
            "sha256" => Self::Sha256,
            _ => Self::None,
        }
    }
}

impl fmt::Display for CksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed checksum: algorithm plus hex value
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cksum {
    #[serde(rename = "type")]
    pub ty: CksumType,
    pub value: String,
}

impl Cksum {
    #[must_use]
    pub fn new(ty: CksumType, value: impl Into<String>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ty == CksumType::None || self.value.is_empty()
    }

    /// Compare against another checksum; differing types never match
    #[must_use]
    pub fn matches(&self, other: &Cksum) -> bool {
        !self.is_empty() && self.ty == other.ty && self.value == other.value
    }
}

impl fmt::Display for Cksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.ty, self.value)
    }
}

enum CalcState {
    None,
    Xxh(Box<Xxh64>),
    Sha(Box<Sha256>),
}

/// Streaming checksum calculator
pub struct CksumCalculator {
    state: CalcState,
    ty: CksumType,
}

impl CksumCalculator {
    #[must_use]
    pub fn new(ty: CksumType) -> Self {
        let state = match ty {
            CksumType::None => CalcState::None,
            CksumType::Xxhash64 => CalcState::Xxh(Box::new(Xxh64::new(0))),
            CksumType::Sha256 => CalcState::Sha(Box::new(Sha256::new())),
        };
        Self { state, ty }
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            CalcState::None => {}
            CalcState::Xxh(x) => x.update(data),
            CalcState::Sha(s) => s.update(data),
        }
    }

    /// Finish and produce the checksum
    #[must_use]
    pub fn finish(self) -> Cksum {
        let value = match self.state {
            CalcState::None => String::new(),
            CalcState::Xxh(x) => format!("{:016x}", x.digest()),
            CalcState::Sha(s) => hex(&s.finalize()),
        };
        Cksum { ty: self.ty, value }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// One-shot helper over a full buffer
#[must_use]
pub fn compute(ty: CksumType, data: &[u8]) -> Cksum {
    let mut calc = CksumCalculator::new(ty);
    calc.update(data);
    calc.finish()
}
