//! CSI volume capability access modes
//!
//! The numeric values are part of the CSI wire contract and must not change.

use crate::domain::model::AccessMode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum CsiAccessMode {
    Unknown = 0,
    SingleNodeWriter = 1,
    SingleNodeReaderOnly = 2,
    MultiNodeReaderOnly = 3,
    MultiNodeSingleWriter = 4,
    MultiNodeMultiWriter = 5,
    SingleNodeSingleWriter = 6,
    SingleNodeMultiWriter = 7,
}

impl CsiAccessMode {
    pub const ALL: [CsiAccessMode; 8] = [
        CsiAccessMode::Unknown,
        CsiAccessMode::SingleNodeWriter,
        CsiAccessMode::SingleNodeReaderOnly,
        CsiAccessMode::MultiNodeReaderOnly,
        CsiAccessMode::MultiNodeSingleWriter,
        CsiAccessMode::MultiNodeMultiWriter,
        CsiAccessMode::SingleNodeSingleWriter,
        CsiAccessMode::SingleNodeMultiWriter,
    ];

    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| *mode as i32 == value)
    }

    pub fn name(self) -> &'static str {
        match self {
            CsiAccessMode::Unknown => "UNKNOWN",
            CsiAccessMode::SingleNodeWriter => "SINGLE_NODE_WRITER",
            CsiAccessMode::SingleNodeReaderOnly => "SINGLE_NODE_READER_ONLY",
            CsiAccessMode::MultiNodeReaderOnly => "MULTI_NODE_READER_ONLY",
            CsiAccessMode::MultiNodeSingleWriter => "MULTI_NODE_SINGLE_WRITER",
            CsiAccessMode::MultiNodeMultiWriter => "MULTI_NODE_MULTI_WRITER",
            CsiAccessMode::SingleNodeSingleWriter => "SINGLE_NODE_SINGLE_WRITER",
            CsiAccessMode::SingleNodeMultiWriter => "SINGLE_NODE_MULTI_WRITER",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.name() == name)
    }

    /// Platform access mode this CSI mode is served as.
    ///
    /// `MULTI_NODE_SINGLE_WRITER` has no platform equivalent narrower than
    /// `ReadWriteMany`.
    pub fn to_access_mode(self) -> Option<AccessMode> {
        match self {
            CsiAccessMode::Unknown => None,
            CsiAccessMode::SingleNodeWriter | CsiAccessMode::SingleNodeMultiWriter => {
                Some(AccessMode::ReadWriteOnce)
            }
            CsiAccessMode::SingleNodeReaderOnly => Some(AccessMode::ReadWriteOnce),
            CsiAccessMode::SingleNodeSingleWriter => Some(AccessMode::ReadWriteOncePod),
            CsiAccessMode::MultiNodeReaderOnly => Some(AccessMode::ReadOnlyMany),
            CsiAccessMode::MultiNodeSingleWriter | CsiAccessMode::MultiNodeMultiWriter => {
                Some(AccessMode::ReadWriteMany)
            }
        }
    }
}

impl From<CsiAccessMode> for i32 {
    fn from(mode: CsiAccessMode) -> i32 {
        mode as i32
    }
}

impl TryFrom<i32> for CsiAccessMode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        CsiAccessMode::from_i32(value)
            .ok_or_else(|| Error::Validation(format!("unknown CSI access mode {}", value)))
    }
}

impl From<AccessMode> for CsiAccessMode {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::ReadWriteOnce => CsiAccessMode::SingleNodeWriter,
            AccessMode::ReadOnlyMany => CsiAccessMode::MultiNodeReaderOnly,
            AccessMode::ReadWriteMany => CsiAccessMode::MultiNodeMultiWriter,
            AccessMode::ReadWriteOncePod => CsiAccessMode::SingleNodeSingleWriter,
        }
    }
}

impl std::fmt::Display for CsiAccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_fixed() {
        let expected = [
            (0, "UNKNOWN"),
            (1, "SINGLE_NODE_WRITER"),
            (2, "SINGLE_NODE_READER_ONLY"),
            (3, "MULTI_NODE_READER_ONLY"),
            (4, "MULTI_NODE_SINGLE_WRITER"),
            (5, "MULTI_NODE_MULTI_WRITER"),
            (6, "SINGLE_NODE_SINGLE_WRITER"),
            (7, "SINGLE_NODE_MULTI_WRITER"),
        ];
        for (value, name) in expected {
            let mode = CsiAccessMode::from_i32(value).unwrap();
            assert_eq!(mode.name(), name);
            assert_eq!(i32::from(mode), value);
            assert_eq!(CsiAccessMode::from_name(name), Some(mode));
        }
        assert!(CsiAccessMode::from_i32(8).is_none());
        assert!(CsiAccessMode::from_i32(-1).is_none());
    }

    #[test]
    fn test_serializes_as_integer() {
        let json = serde_json::to_string(&CsiAccessMode::MultiNodeMultiWriter).unwrap();
        assert_eq!(json, "5");
        let parsed: CsiAccessMode = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, CsiAccessMode::MultiNodeReaderOnly);
        assert!(serde_json::from_str::<CsiAccessMode>("9").is_err());
    }

    #[test]
    fn test_platform_mapping() {
        assert_eq!(CsiAccessMode::Unknown.to_access_mode(), None);
        for mode in AccessMode::ALL {
            assert_eq!(CsiAccessMode::from(mode).to_access_mode(), Some(mode));
        }
    }
}
