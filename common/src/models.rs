//! Registry of selectable face detectors.
//!
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Identifier of a face detection backend.
///
/// The string form is used for selection in the UI and for persistence.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum DetectorKind {
    /// Small, fast Ultraface network at 320x240.
    #[default]
    #[serde(rename = "tiny")]
    Tiny,
    /// BlazeFace short range model.
    #[serde(rename = "blaze-short")]
    BlazeShort,
    /// BlazeFace full range model with sparse weights.
    #[serde(rename = "blaze-full-range-sparse")]
    BlazeFullRangeSparse,
    /// SSD-style Ultraface network at 640x480.
    #[serde(rename = "ssd-mobilenet")]
    SsdMobilenet,
    /// Tiny detector combined with BlazeFace short range.
    #[serde(rename = "tiny-blaze")]
    TinyBlaze,
}

impl DetectorKind {
    /// All selectable detectors in display order.
    pub const ALL: [DetectorKind; 5] = [
        DetectorKind::Tiny,
        DetectorKind::BlazeShort,
        DetectorKind::BlazeFullRangeSparse,
        DetectorKind::SsdMobilenet,
        DetectorKind::TinyBlaze,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Tiny => "tiny",
            DetectorKind::BlazeShort => "blaze-short",
            DetectorKind::BlazeFullRangeSparse => "blaze-full-range-sparse",
            DetectorKind::SsdMobilenet => "ssd-mobilenet",
            DetectorKind::TinyBlaze => "tiny-blaze",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known detector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown face detection model `{0}`")]
pub struct UnknownDetector(pub String);

impl FromStr for DetectorKind {
    type Err = UnknownDetector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetectorKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownDetector(s.to_owned()))
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn parses_every_registered_name() {
        for kind in DetectorKind::ALL {
            assert_eq!(kind.as_str().parse::<DetectorKind>(), Ok(kind));
        }
    }

    #[test]
    fn rejects_unknown_names() {
        assert_eq!(
            "Tiny".parse::<DetectorKind>(),
            Err(UnknownDetector("Tiny".into()))
        );
        assert!("".parse::<DetectorKind>().is_err());
    }

    #[test]
    fn serde_uses_registry_names() -> Result<(), crate::Error> {
        let json = serde_json::to_string(&DetectorKind::BlazeFullRangeSparse)?;
        assert_eq!(json, "\"blaze-full-range-sparse\"");

        let kind: DetectorKind = serde_json::from_str("\"ssd-mobilenet\"")?;
        assert_eq!(kind, DetectorKind::SsdMobilenet);

        Ok(())
    }
}
