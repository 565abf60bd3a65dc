//! Provides `PrioBitmap`, a 32-bit bit array structure supporting
//! constant-time scans for the most urgent set bit.
use core::fmt;

use super::Init;

/// The number of bit positions held by [`PrioBitmap`].
pub const PRIO_BITMAP_LEN: usize = 32;

/// A 32-bit bit array tracking which priority buckets are occupied.
///
/// Bit `i` corresponds to priority index `i` (priority + 16). Higher indices
/// are more urgent, so [`find_highest`] scans from the top using
/// count-leading-zeros.
///
/// [`find_highest`]: PrioBitmap::find_highest
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitmap {
    bits: u32,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..PRIO_BITMAP_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < PRIO_BITMAP_LEN);
        (self.bits >> i) & 1 != 0
    }

    /// Clear the bit at the specified position.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_LEN);
        self.bits &= !(1u32 << i);
    }

    /// Set the bit at the specified position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < PRIO_BITMAP_LEN);
        self.bits |= 1u32 << i;
    }

    /// Get the position of the most significant set bit, i.e., the occupied
    /// bucket with the most urgent priority.
    #[inline]
    pub fn find_highest(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some((31 - self.bits.leading_zeros()) as usize)
        }
    }
}
