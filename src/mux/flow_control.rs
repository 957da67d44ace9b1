//! Credit-based flow control
//!
//! Each stream carries a credit balance that the reader grows by granting
//! credit and the writer shrinks by writing items or forgoing credit, and up
//! to two limits announced with StopRead and StopWrite. A limit is the
//! remaining quantity allowed from the moment it was announced; later
//! announcements may only lower it.

use super::error::ViolationKind;

/// Credit balance of one stream
///
/// The balance never goes negative and never overflows; operations that
/// would do so fail without changing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreditWindow {
    available: u64,
}

impl CreditWindow {
    /// Create an empty window
    pub fn new() -> Self {
        CreditWindow { available: 0 }
    }

    /// Get current credit
    pub fn available(&self) -> u64 {
        self.available
    }

    /// Check if `amount` credit can be consumed
    pub fn can_consume(&self, amount: u64) -> bool {
        amount <= self.available
    }

    /// Add granted credit
    pub fn grant(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        self.available = self
            .available
            .checked_add(amount)
            .ok_or(ViolationKind::CreditOverflow)?;
        Ok(self.available)
    }

    /// Spend credit on written items
    pub fn consume(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        self.available = self
            .available
            .checked_sub(amount)
            .ok_or(ViolationKind::CreditExceeded)?;
        Ok(self.available)
    }

    /// Give back credit without writing
    pub fn forgo(&mut self, amount: u64) -> Result<u64, ViolationKind> {
        self.available = self
            .available
            .checked_sub(amount)
            .ok_or(ViolationKind::ForgoExceedsBalance)?;
        Ok(self.available)
    }
}

/// Remaining quantity announced by a StopRead or StopWrite
///
/// Unset until the first announcement, which means unlimited. Once set it
/// is a budget: every grant (for StopRead) or regular item written (for
/// StopWrite) after the announcement is charged against it, and a later
/// announcement is compared with what is left, not with the earlier
/// announced value. So StopRead(10), GiveCredit(4), StopRead(8) is
/// [`ViolationKind::LimitIncreased`]: only 6 remain, and 8 would raise it.
/// A peer that only compares against the smallest value announced so far
/// would accept that sequence and gets terminated here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitTracker {
    remaining: Option<u64>,
}

impl LimitTracker {
    /// Create an unset limit
    pub fn new() -> Self {
        LimitTracker { remaining: None }
    }

    /// Get the remaining quantity, `None` if no limit was announced
    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    /// Check if a limit was announced and is used up
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Check if `amount` fits within the remaining quantity
    pub fn allows(&self, amount: u64) -> bool {
        self.remaining.map_or(true, |left| amount <= left)
    }

    /// Announce a new limit
    ///
    /// Fails with [`ViolationKind::LimitIncreased`] if `limit` is above the
    /// current remaining quantity.
    pub fn shrink(&mut self, limit: u64) -> Result<(), ViolationKind> {
        if !self.allows(limit) {
            return Err(ViolationKind::LimitIncreased);
        }
        self.remaining = Some(limit);
        Ok(())
    }

    /// Spend `amount` of the remaining quantity
    pub fn charge(&mut self, amount: u64) -> Result<(), ViolationKind> {
        if let Some(left) = self.remaining {
            let left = left
                .checked_sub(amount)
                .ok_or(ViolationKind::LimitExceeded)?;
            self.remaining = Some(left);
        }
        Ok(())
    }
}
