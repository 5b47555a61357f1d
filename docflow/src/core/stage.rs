//! Stage names of the document pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The stages of the canonical document pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    /// Pull structured fields out of the uploaded file.
    Extraction,
    /// Write the business record.
    Persistence,
    /// Attach per-line-item enrichment.
    Enrichment,
    /// Push the record to the external commerce system.
    ExternalSync,
    /// Set the final status on the business record.
    Finalization,
}

impl DocumentStage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::Extraction,
        Self::Persistence,
        Self::Enrichment,
        Self::ExternalSync,
        Self::Finalization,
    ];

    /// Returns the stage name used as registry key and queue suffix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Persistence => "persistence",
            Self::Enrichment => "enrichment",
            Self::ExternalSync => "external_sync",
            Self::Finalization => "finalization",
        }
    }
}

impl fmt::Display for DocumentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown document stage '{s}'"))
    }
}

impl From<DocumentStage> for String {
    fn from(stage: DocumentStage) -> Self {
        stage.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let names: Vec<_> = DocumentStage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec!["extraction", "persistence", "enrichment", "external_sync", "finalization"]
        );
        assert!(DocumentStage::Extraction < DocumentStage::Finalization);
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!("external_sync".parse::<DocumentStage>().unwrap(), DocumentStage::ExternalSync);
        assert!("ocr".parse::<DocumentStage>().is_err());
    }
}
