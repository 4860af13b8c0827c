//! Container platform version compatibility

use crate::error::{Error, Result};
use std::str::FromStr;

pub const KUBERNETES_VERSION_MIN: &str = "1.26";
pub const KUBERNETES_VERSION_MAX: &str = "1.34";

/// `major.minor` of a platform release; patch and build metadata are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlatformVersion {
    pub major: u32,
    pub minor: u32,
}

impl PlatformVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl FromStr for PlatformVersion {
    type Err = Error;

    /// Accepts `1.28`, `v1.28.3`, `1.28+` and `v1.28.3-eks-1234`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("invalid platform version '{}'", s));
        let trimmed = s.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');

        let major = parts
            .next()
            .and_then(leading_number)
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(leading_number)
            .ok_or_else(invalid)?;

        Ok(Self { major, minor })
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

impl std::fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Reject `version` when its `major.minor` lies outside `[min, max]`
pub fn check_platform_version(version: &str, min: &str, max: &str) -> Result<PlatformVersion> {
    let parsed: PlatformVersion = version.parse()?;
    let lower: PlatformVersion = min.parse()?;
    let upper: PlatformVersion = max.parse()?;

    if parsed < lower || parsed > upper {
        return Err(Error::UnsupportedVersion {
            version: parsed.to_string(),
            min: lower.to_string(),
            max: upper.to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_variants() {
        assert_eq!("1.28".parse::<PlatformVersion>().unwrap(), PlatformVersion::new(1, 28));
        assert_eq!("v1.29.3".parse::<PlatformVersion>().unwrap(), PlatformVersion::new(1, 29));
        assert_eq!("1.27+".parse::<PlatformVersion>().unwrap(), PlatformVersion::new(1, 27));
        assert_eq!(
            "v1.30.1-eks-49c6de4".parse::<PlatformVersion>().unwrap(),
            PlatformVersion::new(1, 30)
        );
        assert!("garbage".parse::<PlatformVersion>().is_err());
        assert!("1".parse::<PlatformVersion>().is_err());
    }

    #[test]
    fn test_bounds_are_inclusive() {
        assert!(check_platform_version("1.26", KUBERNETES_VERSION_MIN, KUBERNETES_VERSION_MAX).is_ok());
        assert!(check_platform_version("1.34.2", KUBERNETES_VERSION_MIN, KUBERNETES_VERSION_MAX).is_ok());
    }

    #[test]
    fn test_out_of_range_names_both_bounds() {
        let err = check_platform_version("1.25", "1.26", "1.34").unwrap_err();
        assert_matches!(
            err,
            Error::UnsupportedVersion { ref version, ref min, ref max }
                if version == "1.25" && min == "1.26" && max == "1.34"
        );

        let err = check_platform_version("1.35", "1.26", "1.34").unwrap_err();
        assert!(err.to_string().contains("1.26"));
        assert!(err.to_string().contains("1.34"));
    }
}
