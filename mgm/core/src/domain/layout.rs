// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Packed layout identifiers.
//!
//! A layout id is a single integer stored on every file that encodes how the
//! file is striped across file systems:
//!
//! ```text
//! bits  0..4   checksum kind
//! bits  4..8   layout type (plain / replica / raid-dp / raid-6 / archive)
//! bits  8..16  stripe count - 1
//! bits 16..20  block size code (4k << code)
//! bits 20..24  block checksum kind
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("invalid layout type code {0}")]
    InvalidType(u32),

    #[error("stripe count {0} out of range (1..=256)")]
    InvalidStripeCount(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutType {
    Plain,
    Replica,
    RaidDp,
    Raid6,
    Archive,
}

impl LayoutType {
    fn from_code(code: u32) -> Result<Self, LayoutError> {
        match code {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Replica),
            2 => Ok(Self::RaidDp),
            3 => Ok(Self::Raid6),
            4 => Ok(Self::Archive),
            other => Err(LayoutError::InvalidType(other)),
        }
    }

    fn code(self) -> u32 {
        match self {
            Self::Plain => 0,
            Self::Replica => 1,
            Self::RaidDp => 2,
            Self::Raid6 => 3,
            Self::Archive => 4,
        }
    }

    /// Number of parity stripes the layout can lose while staying readable.
    pub fn redundancy(self) -> u32 {
        match self {
            Self::Plain | Self::Replica => 0,
            Self::RaidDp | Self::Raid6 => 2,
            Self::Archive => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    None,
    Adler32,
    Crc32,
    Crc32c,
    Md5,
    Sha1,
}

impl ChecksumKind {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Adler32,
            2 => Self::Crc32,
            3 => Self::Crc32c,
            4 => Self::Md5,
            5 => Self::Sha1,
            _ => Self::None,
        }
    }

    fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Adler32 => 1,
            Self::Crc32 => 2,
            Self::Crc32c => 3,
            Self::Md5 => 4,
            Self::Sha1 => 5,
        }
    }
}

/// Packed layout id, the `lid` carried on every file and capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutId(pub u32);

impl LayoutId {
    pub fn new(
        layout: LayoutType,
        checksum: ChecksumKind,
        stripes: u32,
        blocksize_code: u32,
        block_checksum: ChecksumKind,
    ) -> Result<Self, LayoutError> {
        if stripes == 0 || stripes > 256 {
            return Err(LayoutError::InvalidStripeCount(stripes));
        }

        Ok(Self(
            (checksum.code() & 0xf)
                | ((layout.code() & 0xf) << 4)
                | (((stripes - 1) & 0xff) << 8)
                | ((blocksize_code & 0xf) << 16)
                | ((block_checksum.code() & 0xf) << 20),
        ))
    }

    /// Single-stripe plain layout with an adler checksum, the creation default.
    pub fn plain() -> Self {
        Self::new(LayoutType::Plain, ChecksumKind::Adler32, 1, 0, ChecksumKind::None)
            .expect("static layout")
    }

    pub fn replica(stripes: u32) -> Result<Self, LayoutError> {
        Self::new(
            LayoutType::Replica,
            ChecksumKind::Adler32,
            stripes,
            0,
            ChecksumKind::None,
        )
    }

    pub fn layout_type(self) -> LayoutType {
        LayoutType::from_code((self.0 >> 4) & 0xf).unwrap_or(LayoutType::Plain)
    }

    pub fn checksum(self) -> ChecksumKind {
        ChecksumKind::from_code(self.0 & 0xf)
    }

    pub fn block_checksum(self) -> ChecksumKind {
        ChecksumKind::from_code((self.0 >> 20) & 0xf)
    }

    /// Total number of stripes the layout places at write time.
    pub fn stripe_count(self) -> u32 {
        ((self.0 >> 8) & 0xff) + 1
    }

    pub fn block_size(self) -> u64 {
        4096u64 << ((self.0 >> 16) & 0xf)
    }

    /// Minimum number of online stripes required to serve a read.
    pub fn min_online_replica(self) -> u32 {
        match self.layout_type() {
            LayoutType::Plain | LayoutType::Replica => 1,
            t => self.stripe_count().saturating_sub(t.redundancy()).max(1),
        }
    }

    /// Number of stripes that must be online for a fully healthy layout.
    pub fn online_stripe_count(self) -> u32 {
        self.stripe_count()
    }

    /// Physical/logical redundancy multiplier, never below 1.0.
    ///
    /// Replicated layouts store `stripes` full copies; RAID layouts store
    /// `stripes / (stripes - redundancy)` of the logical size.
    pub fn size_factor(self) -> f64 {
        let factor = match self.layout_type() {
            LayoutType::Plain => 1.0,
            LayoutType::Replica => f64::from(self.stripe_count()),
            t => {
                let stripes = f64::from(self.stripe_count());
                let data = stripes - f64::from(t.redundancy());
                if data > 0.0 {
                    stripes / data
                } else {
                    1.0
                }
            }
        };

        factor.max(1.0)
    }
}

impl std::fmt::Display for LayoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let lid = LayoutId::new(
            LayoutType::Raid6,
            ChecksumKind::Adler32,
            6,
            2,
            ChecksumKind::Crc32c,
        )
        .unwrap();

        assert_eq!(lid.layout_type(), LayoutType::Raid6);
        assert_eq!(lid.checksum(), ChecksumKind::Adler32);
        assert_eq!(lid.stripe_count(), 6);
        assert_eq!(lid.block_size(), 4096 << 2);
        assert_eq!(lid.block_checksum(), ChecksumKind::Crc32c);
    }

    #[test]
    fn test_min_online_replica() {
        assert_eq!(LayoutId::plain().min_online_replica(), 1);
        assert_eq!(LayoutId::replica(3).unwrap().min_online_replica(), 1);

        let raid6 = LayoutId::new(LayoutType::Raid6, ChecksumKind::None, 6, 0, ChecksumKind::None)
            .unwrap();
        assert_eq!(raid6.min_online_replica(), 4);
        assert_eq!(raid6.online_stripe_count(), 6);
    }

    #[test]
    fn test_size_factor_never_below_one() {
        assert_eq!(LayoutId::plain().size_factor(), 1.0);
        assert_eq!(LayoutId::replica(2).unwrap().size_factor(), 2.0);

        let raid = LayoutId::new(LayoutType::RaidDp, ChecksumKind::None, 6, 0, ChecksumKind::None)
            .unwrap();
        assert!((raid.size_factor() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stripe_count_bounds() {
        assert!(LayoutId::replica(0).is_err());
        assert!(matches!(
            LayoutId::replica(300),
            Err(LayoutError::InvalidStripeCount(300))
        ));
    }
}
