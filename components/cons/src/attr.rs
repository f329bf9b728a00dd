//! Terminal attributes
//!
//! Serial-line discipline flags of a console channel. Bit values follow the
//! classic termios layout.

use bitflags::bitflags;

bitflags! {
    /// Input processing flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InputFlags: u32 {
        /// Ignore break conditions
        const IGNBRK = 0o1;
        /// Break conditions are recorded as break markers
        const BRKINT = 0o2;
        /// Discard carriage returns
        const IGNCR  = 0o200;
        /// Translate carriage return to newline
        const ICRNL  = 0o400;
    }
}

bitflags! {
    /// Output processing flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OutputFlags: u32 {
        /// Insert a carriage return before each newline
        const ONLCR  = 0o4;
        /// Translate carriage return to newline
        const OCRNL  = 0o10;
        /// Discard carriage returns
        const ONLRET = 0o40;
    }
}

bitflags! {
    /// Local mode flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LocalFlags: u32 {
        /// Canonical mode: output is not flushed after every batch
        const ICANON = 0o2;
        /// Echo input back to the output
        const ECHO   = 0o10;
    }
}

/// Attribute set of one console channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VconAttr {
    pub iflags: InputFlags,
    pub oflags: OutputFlags,
    pub lflags: LocalFlags,
}

impl VconAttr {
    /// Defaults of a direct-line console
    pub fn line_defaults() -> Self {
        Self {
            iflags: InputFlags::ICRNL,
            oflags: OutputFlags::ONLRET | OutputFlags::ONLCR,
            lflags: LocalFlags::ECHO,
        }
    }

    /// Raw mode, no processing at all
    pub fn raw() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_defaults() {
        let attr = VconAttr::line_defaults();
        assert!(attr.iflags.contains(InputFlags::ICRNL));
        assert!(attr.oflags.contains(OutputFlags::ONLCR | OutputFlags::ONLRET));
        assert!(!attr.oflags.contains(OutputFlags::OCRNL));
        assert_eq!(attr.lflags, LocalFlags::ECHO);
    }

    #[test]
    fn test_raw_is_empty() {
        let attr = VconAttr::raw();
        assert!(attr.iflags.is_empty() && attr.oflags.is_empty() && attr.lflags.is_empty());
    }
}
