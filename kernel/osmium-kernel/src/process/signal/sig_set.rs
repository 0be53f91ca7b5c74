use core::ops;

use super::sig_num::{SigNum, SIGKILL, SIGSTOP, SIGTHKILL};

/// A bit-set of signals; bit `n` stands for signal number `n`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct SigSet {
    bits: u64,
}

impl From<SigNum> for SigSet {
    fn from(signum: SigNum) -> Self {
        Self {
            bits: 1u64 << signum.as_usize(),
        }
    }
}

impl From<u64> for SigSet {
    fn from(bits: u64) -> Self {
        SigSet { bits }
    }
}

impl From<SigSet> for u64 {
    fn from(set: SigSet) -> u64 {
        set.bits
    }
}

impl ops::BitOr for SigSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        SigSet {
            bits: self.bits | rhs.bits,
        }
    }
}

impl ops::BitOrAssign for SigSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bits |= rhs.bits;
    }
}

impl ops::BitAnd for SigSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        SigSet {
            bits: self.bits & rhs.bits,
        }
    }
}

impl ops::Not for SigSet {
    type Output = Self;

    fn not(self) -> Self {
        SigSet { bits: !self.bits }
    }
}

impl SigSet {
    pub const fn new_empty() -> Self {
        SigSet { bits: 0 }
    }

    pub const fn as_u64(self) -> u64 {
        self.bits
    }

    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn contains(self, signum: SigNum) -> bool {
        self.bits & (1u64 << signum.as_usize()) != 0
    }

    pub fn add(&mut self, signum: SigNum) {
        self.bits |= 1u64 << signum.as_usize();
    }

    pub fn remove(&mut self, signum: SigNum) {
        self.bits &= !(1u64 << signum.as_usize());
    }

    /// Clears the bits of the never-blockable signals; used on every
    /// value that ends up in a thread's blocked mask.
    pub fn without_unblockable(self) -> Self {
        let mut set = self;
        set.remove(SIGKILL);
        set.remove(SIGSTOP);
        set.remove(SIGTHKILL);
        set
    }

    /// The lowest-numbered signal in the set.
    pub fn lowest(self) -> Option<SigNum> {
        if self.bits == 0 {
            return None;
        }
        SigNum::try_from_i32(self.bits.trailing_zeros() as i32).ok()
    }
}

#[if_cfg_ktest]
mod test {
    use super::super::sig_num::{SIGHUP, SIGKILL, SIGTERM};
    use super::*;

    #[ktest]
    fn set_and_test() {
        let mut set = SigSet::new_empty();
        set.add(SIGHUP);
        set.add(SIGTERM);
        assert!(set.contains(SIGHUP));
        assert!(!set.contains(SIGKILL));
        set.remove(SIGHUP);
        assert!(!set.contains(SIGHUP));
    }

    #[ktest]
    fn unblockable_bits_are_stripped() {
        let mut set = SigSet::new_empty();
        set.add(SIGKILL);
        set.add(SIGTERM);
        let masked = set.without_unblockable();
        assert!(!masked.contains(SIGKILL));
        assert!(masked.contains(SIGTERM));
    }

    #[ktest]
    fn lowest_picks_the_smallest_number() {
        let mut set = SigSet::new_empty();
        set.add(SIGTERM);
        set.add(SIGHUP);
        assert_eq!(set.lowest(), Some(SIGHUP));
    }
}
