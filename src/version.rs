//! Dotted numeric versions (`9.2`, `4.8.0`, `5.10.46`).
//!
//! Used for compiler versions and for the leading `X.Y.Z` of kernel
//! releases. Missing trailing components compare as zero, so `9.2 == 9.2.0`.

use anyhow::{bail, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Version {
    parts: Vec<u32>,
}

impl Version {
    pub fn new(parts: &[u32]) -> Self {
        Self {
            parts: parts.to_vec(),
        }
    }

    /// Parse the leading dotted-number prefix of `s`.
    ///
    /// `"5.10.0-8-amd64"` yields `5.10.0`; trailing text is ignored.
    pub fn parse_prefix(s: &str) -> Option<Self> {
        let mut parts = Vec::new();
        for piece in s.split('.') {
            let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            parts.push(digits.parse().ok()?);
            if digits.len() != piece.len() {
                break;
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(Self { parts })
        }
    }

    pub fn major(&self) -> u32 {
        self.component(0)
    }

    pub fn minor(&self) -> u32 {
        self.component(1)
    }

    fn component(&self, idx: usize) -> u32 {
        self.parts.get(idx).copied().unwrap_or(0)
    }

    /// The same version with everything after `major.minor` dropped.
    pub fn major_minor(&self) -> Self {
        Self {
            parts: vec![self.major(), self.minor()],
        }
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut parts = Vec::new();
        for piece in s.split('.') {
            match piece.parse::<u32>() {
                Ok(n) => parts.push(n),
                Err(_) => bail!("invalid version '{}'", s),
            }
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", text.join("."))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for idx in 0..len {
            match self.component(idx).cmp(&other.component(idx)) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_ordering() {
        assert!(v("4.4") < v("9.2"));
        assert!(v("9.2") < v("10.0"));
        assert!(v("4.14") > v("4.9"));
        assert_eq!(v("9.2"), v("9.2.0"));
    }

    #[test]
    fn test_parse_prefix() {
        assert_eq!(Version::parse_prefix("5.10.0-8-amd64"), Some(v("5.10.0")));
        assert_eq!(Version::parse_prefix("4.18.0-497.el8.x86_64"), Some(v("4.18.0")));
        assert_eq!(Version::parse_prefix("3033.2.0"), Some(v("3033.2.0")));
        assert_eq!(Version::parse_prefix("linux"), None);
    }

    #[test]
    fn test_major_minor() {
        let ver = v("9.2.1");
        assert_eq!(ver.major(), 9);
        assert_eq!(ver.minor(), 2);
        assert_eq!(ver.major_minor().to_string(), "9.2");
    }

    #[test]
    fn test_invalid() {
        assert!("9.x".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
    }

    proptest! {
        #[test]
        fn ordering_matches_tuples(a in 0u32..50, b in 0u32..50, c in 0u32..50, d in 0u32..50) {
            let left = Version::new(&[a, b]);
            let right = Version::new(&[c, d]);
            prop_assert_eq!(left.cmp(&right), (a, b).cmp(&(c, d)));
        }

        #[test]
        fn display_parses_back(a in 0u32..1000, b in 0u32..1000, c in 0u32..1000) {
            let ver = Version::new(&[a, b, c]);
            prop_assert_eq!(ver.to_string().parse::<Version>().unwrap(), ver);
        }
    }
}
