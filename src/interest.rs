use std::{fmt, ops};

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// Readiness interest a channel registers with its loop's poller.
///
/// Unlike a plain event filter this set may be empty: a channel that has
/// disabled everything stays constructed, and an empty set is what tells the
/// poller to drop the registration.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Interest(u8);

impl Interest {
    /// No interest; the poller deregisters the descriptor.
    pub(crate) const NONE: Interest = Interest(0);
    /// Readable interest, including urgent (out-of-band) data.
    pub(crate) const READABLE: Interest = Interest(READABLE);
    /// Writable interest.
    pub(crate) const WRITABLE: Interest = Interest(WRITABLE);

    pub(crate) const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub(crate) const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub(crate) const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    pub(crate) const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    pub(crate) const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Interest {
        Interest(bits)
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(fmt, "NONE");
        }
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
        }
        Ok(())
    }
}
