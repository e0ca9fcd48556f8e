use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Escalation level last notified for a loan. Ordered: a record only ever
/// moves forward through these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Unnotified,
    Week3,
    Week4,
}

impl Stage {
    /// Stages that carry a notice, lowest first.
    pub const NOTIFIED: [Stage; 2] = [Stage::Week3, Stage::Week4];

    /// The stage a loan of `days` elapsed days belongs to.
    pub fn for_days(days: i64) -> Stage {
        match days {
            d if d >= 28 => Stage::Week4,
            21..=27 => Stage::Week3,
            _ => Stage::Unnotified,
        }
    }

    /// Value persisted into the alert-stage property.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Unnotified => "",
            Stage::Week3 => "WEEK_3",
            Stage::Week4 => "WEEK_4",
        }
    }

    /// Parse a stored label. Anything unrecognised reads as `Unnotified` so a
    /// damaged label leads to another notice rather than silence.
    pub fn parse(label: &str) -> Stage {
        let label = label.trim();
        Stage::NOTIFIED
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(label))
            .unwrap_or(Stage::Unnotified)
    }

    /// The last stage; records here are excluded from candidate queries.
    pub fn terminal() -> Stage {
        Stage::Week4
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Unnotified => write!(f, "none"),
            Stage::Week3 => write!(f, "week 3"),
            Stage::Week4 => write!(f, "week 4"),
        }
    }
}

/// How the alert-stage property is stored in the loans database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageEncoding {
    /// Detect from the database schema at startup.
    #[default]
    Auto,
    Select,
    Status,
    RichText,
}

impl StageEncoding {
    /// Notion property type keyword for this encoding.
    pub fn property_type(&self) -> &'static str {
        match self {
            StageEncoding::Select | StageEncoding::Auto => "select",
            StageEncoding::Status => "status",
            StageEncoding::RichText => "rich_text",
        }
    }

    pub fn from_property_type(typ: &str) -> Option<StageEncoding> {
        match typ {
            "select" => Some(StageEncoding::Select),
            "status" => Some(StageEncoding::Status),
            "rich_text" => Some(StageEncoding::RichText),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Borrower {
    pub user_id: String,
    pub name: String,
    /// Address exposed directly on the people property, when the workspace shares it.
    pub email: Option<String>,
}

/// One page of the loans database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowedItem {
    pub id: String,
    pub title: String,
    pub url: String,
    pub borrowers: Vec<Borrower>,
    pub borrowed_on: Option<NaiveDate>,
    pub alert_stage: String,
}

impl BorrowedItem {
    pub const UNTITLED: &'static str = "(untitled)";

    pub fn borrower_names(&self) -> String {
        let names: Vec<&str> = self
            .borrowers
            .iter()
            .map(|b| b.name.trim())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            "(unknown borrower)".to_string()
        } else {
            names.join(", ")
        }
    }
}
