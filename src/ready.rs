use std::{fmt, ops};

const READABLE: usize = 1 << 0;
const WRITABLE: usize = 1 << 1;
const ERROR: usize = 1 << 2;
const HUP: usize = 1 << 3;

/// Interest and readiness bits for a single descriptor.
///
/// A channel registers interest in `readable` and/or `writable`; the poller
/// hands the same mask back as revents, possibly extended with `error` and
/// `hup`, which cannot be requested and are reported whenever the kernel
/// raises them.
///
/// Masks combine with `|`:
///
/// ```
/// use hive_net::Ready;
///
/// let interest = Ready::readable() | Ready::writable();
///
/// assert!(interest.is_readable());
/// assert!(!interest.is_error());
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ready(usize);

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    /// The kernel flagged an error condition on the descriptor. Only ever
    /// seen in revents, never registered as interest.
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// The peer closed, or shut down the writing half of, its end. Only
    /// ever seen in revents, never registered as interest.
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.has(READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.has(WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.has(ERROR)
    }

    pub fn is_hup(self) -> bool {
        self.has(HUP)
    }

    /// The raw bits, for storage in a channel's atomic interest mask.
    pub fn as_usize(self) -> usize {
        self.0
    }

    fn has(self, bit: usize) -> bool {
        self.0 & bit != 0
    }
}

impl From<usize> for Ready {
    fn from(bits: usize) -> Ready {
        Ready(bits)
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }

        let mut sep = "";
        for (bit, name) in [
            (READABLE, "readable"),
            (WRITABLE, "writable"),
            (ERROR, "error"),
            (HUP, "hup"),
        ] {
            if self.has(bit) {
                write!(f, "{}{}", sep, name)?;
                sep = "|";
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn union_and_predicates() {
        let interest = Ready::readable() | Ready::writable();

        assert!(interest.is_readable());
        assert!(interest.is_writable());
        assert!(!interest.is_error());
        assert!(!interest.is_hup());
        assert!(!interest.is_empty());

        assert!(Ready::empty().is_empty());
    }

    #[test]
    fn bitor_assign_accumulates() {
        let mut revents = Ready::empty();
        revents |= Ready::readable();
        revents |= Ready::hup();

        assert_eq!(revents, Ready::readable() | Ready::hup());
    }

    #[test]
    fn round_trips_through_raw_bits() {
        // interest masks live in the channel's atomic as plain bits
        let revents = Ready::error() | Ready::hup();

        assert_eq!(Ready::from(revents.as_usize()), revents);
        assert!(Ready::from(revents.as_usize()).is_hup());
    }

    #[test]
    fn debug_lists_set_bits() {
        assert_eq!(format!("{:?}", Ready::empty()), "(none)");
        assert_eq!(
            format!("{:?}", Ready::readable() | Ready::hup()),
            "readable|hup"
        );
    }
}
