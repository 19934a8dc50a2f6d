use std::fmt;

const READABLE: u8 = 0b0_0001;
const WRITABLE: u8 = 0b0_0010;
const ERROR: u8 = 0b0_0100;
const HANGUP: u8 = 0b0_1000;
const PRIORITY: u8 = 0b1_0000;

/// What the kernel reported for one channel on the last poll.
///
/// Backend-neutral: both the epoll and the `poll(2)` demultiplexer translate
/// their native event bits into this set before dispatch, so channel dispatch
/// never sees backend specifics.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Readiness(u8);

impl Readiness {
    pub(crate) const EMPTY: Readiness = Readiness(0);
    pub(crate) const READABLE: Readiness = Readiness(READABLE);
    pub(crate) const WRITABLE: Readiness = Readiness(WRITABLE);
    pub(crate) const ERROR: Readiness = Readiness(ERROR);
    pub(crate) const HANGUP: Readiness = Readiness(HANGUP);
    pub(crate) const PRIORITY: Readiness = Readiness(PRIORITY);

    pub(crate) const fn add(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }

    pub(crate) const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    pub(crate) const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    pub(crate) const fn is_error(self) -> bool {
        (self.0 & ERROR) != 0
    }

    pub(crate) const fn is_hangup(self) -> bool {
        (self.0 & HANGUP) != 0
    }

    pub(crate) const fn is_priority(self) -> bool {
        (self.0 & PRIORITY) != 0
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn from_bits(bits: u8) -> Readiness {
        Readiness(bits)
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(fmt, "EMPTY");
        }
        let mut one = false;
        for (set, name) in [
            (self.is_readable(), "READABLE"),
            (self.is_writable(), "WRITABLE"),
            (self.is_error(), "ERROR"),
            (self.is_hangup(), "HANGUP"),
            (self.is_priority(), "PRIORITY"),
        ] {
            if set {
                if one {
                    write!(fmt, " | ")?;
                }
                write!(fmt, "{}", name)?;
                one = true;
            }
        }
        Ok(())
    }
}
