//! Transaction credit and payload accounting.
//!
//! A transaction is opened with a [`Budget`]: the credit it reserves in the
//! backend log plus the size of the payload it carries. Work sources add
//! their per-item share into an accumulator; the packer compares the
//! accumulated budget against the backend's per-transaction ceiling.

use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Backend credit: number of captured regions and their total size in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credit {
    pub nr: u64,
    pub size: u64,
}

impl Credit {
    pub const ZERO: Credit = Credit { nr: 0, size: 0 };

    pub const fn new(nr: u64, size: u64) -> Self {
        Self { nr, size }
    }

    /// Component-wise `self <= limit`.
    pub fn fits_within(self, limit: Credit) -> bool {
        self.nr <= limit.nr && self.size <= limit.size
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl Add for Credit {
    type Output = Credit;

    fn add(self, rhs: Credit) -> Credit {
        Credit {
            nr: self.nr.saturating_add(rhs.nr),
            size: self.size.saturating_add(rhs.size),
        }
    }
}

impl AddAssign for Credit {
    fn add_assign(&mut self, rhs: Credit) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Credit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.nr, self.size)
    }
}

/// What a single transaction is opened with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Budget {
    pub credit: Credit,
    pub payload: u64,
}

impl Budget {
    pub const ZERO: Budget = Budget {
        credit: Credit::ZERO,
        payload: 0,
    };

    pub const fn new(credit: Credit, payload: u64) -> Self {
        Self { credit, payload }
    }

    /// Add `credit` and `payload` into this accumulator.
    pub fn accumulate(&mut self, credit: Credit, payload: u64) {
        self.credit += credit;
        self.payload = self.payload.saturating_add(payload);
    }

    /// Both the credit and the payload are within `limit`.
    pub fn fits_within(self, limit: Budget) -> bool {
        self.credit.fits_within(limit.credit) && self.payload <= limit.payload
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl Add for Budget {
    type Output = Budget;

    fn add(mut self, rhs: Budget) -> Budget {
        self.accumulate(rhs.credit, rhs.payload);
        self
    }
}

impl AddAssign for Budget {
    fn add_assign(&mut self, rhs: Budget) {
        self.accumulate(rhs.credit, rhs.payload);
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "credit {} payload {}", self.credit, self.payload)
    }
}
