use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The external content providers the pipeline pulls from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// AI-summarization provider (chat completions).
    Perplexity,
    /// Link-aggregator provider (top posts per sub-community).
    Reddit,
    /// Headline-search provider.
    #[value(name = "newsapi")]
    #[serde(rename = "newsapi")]
    NewsApi,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Perplexity, Source::Reddit, Source::NewsApi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Perplexity => "perplexity",
            Source::Reddit => "reddit",
            Source::NewsApi => "newsapi",
        }
    }

    /// Job kind recorded for a run that fans out across every owner.
    pub fn fan_out_kind(&self) -> String {
        format!("{}_all_users", self.as_str())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "perplexity" => Ok(Source::Perplexity),
            "reddit" => Ok(Source::Reddit),
            "newsapi" => Ok(Source::NewsApi),
            other => Err(AppError::Validation(format!("unknown source '{}'", other))),
        }
    }
}

/// How a source's fresh batch lands in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Delete every item of the category, whatever its source, then insert.
    Replace,
    /// Delete only this source's prior items for the category, then insert.
    SourceScoped,
}
