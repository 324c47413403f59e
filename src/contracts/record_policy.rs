use serde::Serialize;
use std::str::FromStr;

/// What the batch driver does with a record that cannot be turned into a
/// message, or whose publish fails.
///
/// - `Abort`: stop at the first bad record and report how far the run got.
/// - `Skip`: log the record, count it as failed and move on to the next one.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordPolicy {
    #[default]
    Abort,
    Skip,
}

impl RecordPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Skip => "skip",
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort)
    }
}

impl FromStr for RecordPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!(
                "unknown record policy '{}', expected 'abort' or 'skip'",
                other
            )),
        }
    }
}

impl std::fmt::Display for RecordPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
