//! Per-transaction packer.
//!
//! Collects the items of the next transaction together with their summed
//! budget. A pack always takes its first item; after that it grows until
//! the item cap is reached or the next item would push the budget over the
//! backend ceiling. That boundary item is parked in a one-slot pushback and
//! becomes the first item of the following pack.

use crate::credit::Budget;

/// Outcome of offering an item to the packer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    /// Packed; there is room for more.
    Packed,
    /// Packed; the item cap is reached.
    Full,
    /// Did not fit. Parked in pushback, the current pack is complete.
    Boundary,
}

pub(crate) struct Packer<I> {
    max_work: usize,
    limit: Budget,
    pending: Vec<(I, Budget)>,
    accum: Budget,
    pushback: Option<I>,
}

impl<I> Packer<I> {
    pub fn new(max_work: usize, limit: Budget) -> Self {
        Self {
            max_work,
            limit,
            pending: Vec::with_capacity(max_work),
            accum: Budget::ZERO,
            pushback: None,
        }
    }

    /// Start a new pack. The previous one must have been drained or discarded.
    pub fn reset(&mut self) {
        debug_assert!(self.pending.is_empty(), "reset with packed items");
        self.pending.clear();
        self.accum = Budget::ZERO;
    }

    /// Offer `item`, whose transaction share is `share`.
    pub fn offer(&mut self, item: I, share: Budget) -> Offer {
        if !self.pending.is_empty() {
            let would_be = self.accum + share;
            if self.pending.len() >= self.max_work || !would_be.fits_within(self.limit) {
                debug_assert!(self.pushback.is_none(), "pushback slot already taken");
                self.pushback = Some(item);
                return Offer::Boundary;
            }
        }

        self.accum += share;
        self.pending.push((item, share));

        if self.pending.len() >= self.max_work {
            Offer::Full
        } else {
            Offer::Packed
        }
    }

    /// The boundary item, to be offered again (its share recomputed) as the
    /// first item of the next pack.
    pub fn take_pushback(&mut self) -> Option<I> {
        self.pushback.take()
    }

    pub fn has_pushback(&self) -> bool {
        self.pushback.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Sum of the shares of the packed items.
    pub fn budget(&self) -> Budget {
        debug_assert_eq!(
            self.accum,
            self.pending
                .iter()
                .fold(Budget::ZERO, |sum, (_, share)| sum + *share)
        );
        self.accum
    }

    /// Hand out the packed items in the order they were offered.
    pub fn drain(&mut self) -> impl Iterator<Item = I> + '_ {
        self.pending.drain(..).map(|(item, _)| item)
    }

    /// Drop the packed items and the pushback. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len() + usize::from(self.pushback.is_some());
        self.pending.clear();
        self.pushback = None;
        self.accum = Budget::ZERO;
        dropped
    }
}
