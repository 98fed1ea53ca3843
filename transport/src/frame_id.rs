use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};

/// Sequence number of a frame inside a single stream. Frame ids start at zero for every
///  stream and are never reused; 64 bits are sufficient to never wrap in practice.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FrameId(u64);

impl Display for FrameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FrameId {
    pub const ZERO: FrameId = FrameId(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> FrameId {
        *self + 1
    }

    /// The number of frames from `other` (incl) to `self` (excl), or `None` if `other` comes
    ///  after `self`
    pub fn distance_from(&self, other: FrameId) -> Option<u64> {
        self.0.checked_sub(other.0)
    }
}

impl Add<u64> for FrameId {
    type Output = FrameId;

    fn add(self, rhs: u64) -> Self::Output {
        FrameId(self.0 + rhs)
    }
}

impl AddAssign<u64> for FrameId {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::same(5, 5, Some(0))]
    #[case::before(5, 2, Some(3))]
    #[case::after(2, 5, None)]
    #[case::from_zero(7, 0, Some(7))]
    fn test_distance_from(#[case] this: u64, #[case] other: u64, #[case] expected: Option<u64>) {
        assert_eq!(FrameId::from_raw(this).distance_from(FrameId::from_raw(other)), expected);
    }

    #[test]
    fn test_next() {
        let mut id = FrameId::ZERO;
        assert_eq!(id.next(), FrameId::from_raw(1));
        id += 3;
        assert_eq!(id, FrameId::from_raw(3));
        assert_eq!(id + 2, FrameId::from_raw(5));
        assert_eq!(id.to_string(), "3");
    }
}
