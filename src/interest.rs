use std::num::NonZeroU8;
use std::{fmt, ops};

/// Readiness interest in a registered handle.
///
/// The size of `Option<Interest>` is identical to `Interest` itself, so a
/// device can carry "no interest at all" without an extra flag.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub(crate) struct Interest(NonZeroU8);

// These must be unique.
const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    pub(crate) const READABLE: Interest =
        Interest(unsafe { NonZeroU8::new_unchecked(READABLE) });

    pub(crate) const WRITABLE: Interest =
        Interest(unsafe { NonZeroU8::new_unchecked(WRITABLE) });

    /// Add together two `Interest`s. Constant-function version of `BitOr`.
    #[allow(dead_code)]
    pub(crate) const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Removes `other` from `self`, `None` if nothing is left.
    #[allow(dead_code)]
    pub(crate) fn remove(self, other: Interest) -> Option<Interest> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Interest)
    }

    pub(crate) const fn is_readable(self) -> bool {
        (self.0.get() & READABLE) != 0
    }

    pub(crate) const fn is_writable(self) -> bool {
        (self.0.get() & WRITABLE) != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 = (*self | other).0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_readable() {
            write!(fmt, "READABLE")?;
            one = true;
        }
        if self.is_writable() {
            if one {
                write!(fmt, " | ")?;
            }
            write!(fmt, "WRITABLE")?;
            one = true;
        }
        debug_assert!(one, "printing empty interest");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn add_and_remove() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());

        let rd = both.remove(Interest::WRITABLE).unwrap();
        assert!(rd.is_readable());
        assert!(!rd.is_writable());

        assert!(rd.remove(Interest::READABLE).is_none());
    }

    #[test]
    fn option_is_free() {
        use std::mem::size_of;
        assert_eq!(size_of::<Option<Interest>>(), size_of::<Interest>());
    }
}
