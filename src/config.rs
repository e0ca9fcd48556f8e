//! Configuration loader and validator for the overdue-loan notifier.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::StageEncoding;
use crate::notion::NotionIds;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Invalid value for {name}: {value:?}")]
    BadEnv { name: &'static str, value: String },
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub app: App,
    pub notion: Notion,
    pub slack: Slack,
    pub smtp: Smtp,
}

/// Sweep-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    /// Pause between query pages, to stay under the Notion rate limit.
    pub page_delay_ms: u64,
    pub http_timeout_seconds: u64,
}

impl Default for App {
    fn default() -> Self {
        Self {
            page_delay_ms: 200,
            http_timeout_seconds: 30,
        }
    }
}

/// Notion API settings and database mappings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Notion {
    pub token: String,
    pub version: String,
    pub databases: Databases,
}

impl Default for Notion {
    fn default() -> Self {
        Self {
            token: String::new(),
            version: "2022-06-28".into(),
            databases: Databases::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Databases {
    pub loans: DbLoans,
    pub contacts: DbContacts,
}

/// Loans database: one page per borrowed item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DbLoans {
    pub id: String,
    pub fields: DbLoanFields,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DbLoanFields {
    pub title: String,
    pub borrower: String,
    pub borrowed_on: String,
    pub alert_stage: String,
    pub alert_stage_type: StageEncoding,
}

impl Default for DbLoanFields {
    fn default() -> Self {
        Self {
            title: "Title".into(),
            borrower: "Borrower".into(),
            borrowed_on: "Borrowed on".into(),
            alert_stage: "Alert stage".into(),
            alert_stage_type: StageEncoding::Auto,
        }
    }
}

/// Contacts database. An empty `id` disables contact lookups.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DbContacts {
    pub id: String,
    pub fields: DbContactFields,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DbContactFields {
    pub person: String,
    /// Typed email property; preferred when both are filled.
    pub email: String,
    /// Free-text property holding an address.
    pub email_text: String,
}

impl Default for DbContactFields {
    fn default() -> Self {
        Self {
            person: "Person".into(),
            email: "Email".into(),
            email_text: String::new(),
        }
    }
}

/// Broadcast channel. An empty URL disables it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Slack {
    pub webhook_url: String,
}

/// Mail transport. Mail is disabled unless host, port, user and pass are all set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Smtp {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Sender address; falls back to `user`.
    pub from: String,
    pub admin_email: String,
}

impl Smtp {
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty()
            && self.port != 0
            && !self.user.trim().is_empty()
            && !self.pass.is_empty()
    }

    pub fn sender(&self) -> &str {
        if self.from.trim().is_empty() {
            self.user.trim()
        } else {
            self.from.trim()
        }
    }

    pub fn admin_address(&self) -> Option<&str> {
        Some(self.admin_email.trim()).filter(|a| !a.is_empty())
    }
}

impl Config {
    /// Field mapping as configured. `alert_stage_type` may still be `Auto`;
    /// `NotionClient::resolve_property_ids` settles it against the schema.
    pub fn notion_ids(&self) -> NotionIds {
        let loans = &self.notion.databases.loans;
        let contacts = &self.notion.databases.contacts;
        NotionIds {
            loans_db: loans.id.trim().to_string(),
            f_title: loans.fields.title.clone(),
            f_borrower: loans.fields.borrower.clone(),
            f_borrowed_on: loans.fields.borrowed_on.clone(),
            f_alert_stage: loans.fields.alert_stage.clone(),
            stage_encoding: loans.fields.alert_stage_type,
            contacts_db: Some(contacts.id.trim().to_string()).filter(|id| !id.is_empty()),
            f_contact_person: contacts.fields.person.clone(),
            f_contact_email: contacts.fields.email.clone(),
            f_contact_email_text: contacts.fields.email_text.clone(),
        }
    }

    /// Overlay environment variables on top of file values. Empty variables are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("NOTION_TOKEN") {
            self.notion.token = v;
        }
        if let Some(v) = get("NOTION_DATABASE_ID") {
            self.notion.databases.loans.id = v;
        }
        if let Some(v) = get("NOTION_CONTACTS_DATABASE_ID") {
            self.notion.databases.contacts.id = v;
        }
        if let Some(v) = get("SLACK_WEBHOOK_URL") {
            self.slack.webhook_url = v;
        }
        if let Some(v) = get("SMTP_HOST") {
            self.smtp.host = v;
        }
        if let Some(v) = get("SMTP_PORT") {
            self.smtp.port = v.parse().map_err(|_| ConfigError::BadEnv {
                name: "SMTP_PORT",
                value: v.clone(),
            })?;
        }
        if let Some(v) = get("SMTP_USER") {
            self.smtp.user = v;
        }
        if let Some(v) = get("SMTP_PASS") {
            self.smtp.pass = v;
        }
        if let Some(v) = get("SMTP_FROM") {
            self.smtp.from = v;
        }
        if let Some(v) = get("ADMIN_EMAIL") {
            self.smtp.admin_email = v;
        }
        Ok(())
    }
}

/// Load configuration from an optional YAML file plus process environment, and validate it.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load`] with an explicit environment lookup.
pub fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            serde_yaml::from_str::<Option<Config>>(&content)?.unwrap_or_default()
        }
        None => Config::default(),
    };
    cfg.apply_env(lookup)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.notion.token.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.token must be non-empty (or set NOTION_TOKEN)"));
    }
    if cfg.notion.version.trim().is_empty() {
        return Err(ConfigError::Invalid("notion.version must be non-empty"));
    }
    if cfg.app.http_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.http_timeout_seconds must be > 0"));
    }

    let loans = &cfg.notion.databases.loans;
    if loans.id.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "notion.databases.loans.id must be non-empty (or set NOTION_DATABASE_ID)",
        ));
    }
    let lf = &loans.fields;
    if lf.title.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "notion.databases.loans.fields.title must be non-empty",
        ));
    }
    if lf.borrower.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "notion.databases.loans.fields.borrower must be non-empty",
        ));
    }
    if lf.borrowed_on.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "notion.databases.loans.fields.borrowed_on must be non-empty",
        ));
    }
    if lf.alert_stage.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "notion.databases.loans.fields.alert_stage must be non-empty",
        ));
    }

    let contacts = &cfg.notion.databases.contacts;
    if !contacts.id.trim().is_empty() {
        let cf = &contacts.fields;
        if cf.person.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "notion.databases.contacts.fields.person must be non-empty",
            ));
        }
        if cf.email.trim().is_empty() && cf.email_text.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "notion.databases.contacts.fields needs email or email_text",
            ));
        }
    }

    Ok(())
}

/// Example configuration, printed by `--print-example-config`.
pub fn example() -> &'static str {
    r#"app:
  page_delay_ms: 200
  http_timeout_seconds: 30

notion:
  token: "YOUR_NOTION_INTEGRATION_TOKEN"
  version: "2022-06-28"

  databases:
    loans:
      id: "NOTION_LOANS_DATABASE_ID"
      fields:
        title: "Title"
        borrower: "Borrower"
        borrowed_on: "Borrowed on"
        alert_stage: "Alert stage"
        # auto | select | status | rich_text
        alert_stage_type: auto
    contacts:
      id: "NOTION_CONTACTS_DATABASE_ID"
      fields:
        person: "Person"
        email: "Email"
        email_text: "Email (text)"

slack:
  webhook_url: ""

smtp:
  host: "smtp.example.com"
  port: 587
  user: "library@example.com"
  pass: ""
  from: ""
  admin_email: "admin@example.com"
"#
}
