use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Runtimes an executor host can serve. Doubles as the envelope `handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    Python,
    Scheme,
    Sql,
    Lark,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::Scheme,
        Language::Sql,
        Language::Lark,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Scheme => "scheme",
            Self::Sql => "sql",
            Self::Lark => "lark",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = RunnerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|language| language.as_str() == normalized)
            .ok_or_else(|| RunnerError::UnsupportedLanguage(raw.trim().to_owned()))
    }
}
