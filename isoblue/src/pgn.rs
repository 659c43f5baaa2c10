use std::fmt;

use crate::error::InvalidPgn;

/// PDU2 format bits. A PGN with a non-zero PS byte must have all of them set.
const PF2_MASK: u32 = 0x00F000;
/// PDU specific (PS) byte.
const PS_MASK: u32 = 0x0000FF;

/// An ISOBUS Parameter Group Number.
///
/// PDU1 PGNs address a specific destination, so their PS byte is always zero
/// in the PGN itself. Only PDU2 PGNs (PF >= 0xF0) carry a group extension in
/// the PS byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pgn(u32);

impl Pgn {
    pub const MIN: u32 = 0;
    pub const MAX: u32 = 0x02FFFF;

    pub fn new(value: u32) -> Result<Self, InvalidPgn> {
        if value & PF2_MASK != PF2_MASK && value & PS_MASK != 0 {
            return Err(InvalidPgn(value));
        }
        if value > Self::MAX {
            return Err(InvalidPgn(value));
        }
        Ok(Self(value))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// True for PDU2 (broadcast) PGNs.
    pub fn is_pdu2(self) -> bool {
        self.0 & PF2_MASK == PF2_MASK
    }
}

impl TryFrom<u32> for Pgn {
    type Error = InvalidPgn;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Pgn::new(value)
    }
}

impl From<Pgn> for u32 {
    fn from(pgn: Pgn) -> Self {
        pgn.0
    }
}

impl fmt::Display for Pgn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PGN:{}", self.0)
    }
}
