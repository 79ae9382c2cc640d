//! Size classes for the segregated free lists.

use core::fmt;

/// Number of segregated free lists.
pub const SIZE_CLASSES: usize = 13;

// Inclusive upper bound, in words, of every class but the last.
const THRESHOLDS: [u32; SIZE_CLASSES - 1] = [4, 6, 8, 16, 48, 112, 240, 474, 960, 1920, 3840, 7694];

/// One bucket of the segregated free-list index.
///
/// The smallest classes hold exactly one or two block sizes; they widen
/// roughly geometrically, and the last class takes everything above 7694
/// words.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    pub const SMALLEST: SizeClass = SizeClass(0);
    pub const LARGEST: SizeClass = SizeClass(SIZE_CLASSES as u8 - 1);

    /// The class a block of `words` words is filed under.
    pub fn for_words(words: u32) -> SizeClass {
        THRESHOLDS
            .iter()
            .position(|&limit| words <= limit)
            .map_or(SizeClass::LARGEST, |ix| SizeClass(ix as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Largest block size in this class, in words; `None` for the catch-all.
    pub fn upper_bound(self) -> Option<u32> {
        THRESHOLDS.get(self.index()).copied()
    }

    /// Every class, smallest first.
    pub fn all() -> impl Iterator<Item = SizeClass> {
        SizeClass::SMALLEST.and_larger()
    }

    /// This class and every larger one, in order.
    pub fn and_larger(self) -> impl Iterator<Item = SizeClass> {
        (self.0..SIZE_CLASSES as u8).map(SizeClass)
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upper_bound() {
            Some(limit) => write!(f, "class {} (..={} words)", self.0, limit),
            None => write!(f, "class {} (large)", self.0),
        }
    }
}
