//! Hop records: one entry per point-to-point relay a chunk traversed.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::PeerId;

/// The kind of connection a hop was made over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Medium {
    #[default]
    Unknown = 0,
    AdHoc = 1,
    Hub = 2,
    Internet = 3,
    Onion = 4,
}

impl Medium {
    /// Wire tag of this medium.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag.
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Medium::Unknown),
            1 => Ok(Medium::AdHoc),
            2 => Ok(Medium::Hub),
            3 => Ok(Medium::Internet),
            4 => Ok(Medium::Onion),
            other => Err(CoreError::UnknownMedium(other)),
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Medium::Unknown => "unknown",
            Medium::AdHoc => "ad-hoc",
            Medium::Hub => "hub",
            Medium::Internet => "internet",
            Medium::Onion => "onion",
        };
        f.write_str(name)
    }
}

/// Attestation of one relay step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    /// The immediate sender of this step.
    pub sender: PeerId,
    /// Connection medium of this step.
    pub medium: Medium,
    /// Whether the transfer was cryptographically verified.
    pub verified: bool,
    /// Whether the transfer was encrypted.
    pub encrypted: bool,
}

impl Hop {
    /// Create a hop record.
    pub fn new(sender: PeerId, medium: Medium, verified: bool, encrypted: bool) -> Self {
        Self {
            sender,
            medium,
            verified,
            encrypted,
        }
    }
}
