use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const KEY_PRIMARY: &str = "url_high_school";
pub const KEY_SECONDARY: &str = "url_middle_school";

/// One of the two timetable documents tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Primary,
    Secondary,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Primary, Category::Secondary];

    /// Key under which the document URL is published in the config service.
    /// Also used as the name of the category's cache directory.
    pub fn config_key(self) -> &'static str {
        match self {
            Category::Primary => KEY_PRIMARY,
            Category::Secondary => KEY_SECONDARY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Primary => "primary",
            Category::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown category '{0}' (expected 'primary' or 'secondary')")]
pub struct UnknownCategory(String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "high_school" | KEY_PRIMARY => Ok(Category::Primary),
            "secondary" | "middle_school" | KEY_SECONDARY => Ok(Category::Secondary),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}
