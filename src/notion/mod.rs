use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{BorrowedItem, Stage, StageEncoding};
use crate::notion::model::{QueryPage, RetrieveDatabaseResp};

pub mod model;

const NOTION_API_BASE: &str = "https://api.notion.com/";
const PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
    page_delay: Duration,
}

/// Database ids and property names the sweep reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionIds {
    pub loans_db: String,
    pub f_title: String,
    pub f_borrower: String,
    pub f_borrowed_on: String,
    pub f_alert_stage: String,
    pub stage_encoding: StageEncoding,
    pub contacts_db: Option<String>,
    pub f_contact_person: String,
    pub f_contact_email: String,
    pub f_contact_email_text: String,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// The loans database: candidate query and stage write-back.
#[async_trait]
pub trait LoanStore: Send + Sync {
    async fn fetch_candidates(&self, ids: &NotionIds) -> Result<Vec<BorrowedItem>>;

    async fn patch_alert_stage(&self, ids: &NotionIds, page_id: &str, stage: Stage) -> Result<()>;
}

/// Borrower identity to email address lookup.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// `Ok(None)` means no usable address; callers skip the borrower.
    async fn resolve_email(&self, ids: &NotionIds, user_id: &str) -> Result<Option<String>>;
}

/// Source of cursor-paginated query results.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<QueryPage>;
}

/// Drain `source` page by page, keeping server order and dropping repeated
/// page ids. `delay` is slept between requests.
pub async fn collect_pages(source: &dyn PageSource, delay: Duration) -> Result<Vec<Value>> {
    let mut results = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = source.fetch_page(cursor.as_deref()).await?;
        pages += 1;
        for item in page.results {
            if let Some(id) = item.get("id").and_then(Value::as_str) {
                if !seen.insert(id.to_string()) {
                    debug!(id, "skipping duplicate page");
                    continue;
                }
            }
            results.push(item);
        }

        if !page.has_more {
            break;
        }
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => {
                warn!(pages, "query reported more results without a cursor; stopping");
                break;
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    debug!(pages, total = results.len(), "query drained");
    Ok(results)
}

/// A single database query bound to its filter body.
struct DatabaseQuery<'a> {
    client: &'a NotionClient,
    database_id: &'a str,
    body: Value,
}

#[async_trait]
impl PageSource for DatabaseQuery<'_> {
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<QueryPage> {
        let mut body = self.body.clone();
        if let Some(cursor) = cursor {
            body["start_cursor"] = json!(cursor);
        }
        let path = format!("v1/databases/{}/query", self.database_id);
        let res = self.client.send(Method::POST, &path, Some(&body)).await?;
        serde_json::from_str(&res).context("invalid Notion query response")
    }
}

impl NotionClient {
    pub fn new(token: String, version: String) -> Result<Self> {
        let base_url = Url::parse(NOTION_API_BASE).context("invalid default Notion URL")?;
        Self::with_base_url(token, version, base_url, Duration::from_secs(30))
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(NOTION_API_BASE).context("invalid default Notion URL")?;
        let client = Self::with_base_url(
            cfg.notion.token.clone(),
            cfg.notion.version.clone(),
            base_url,
            Duration::from_secs(cfg.app.http_timeout_seconds),
        )?;
        Ok(client.with_page_delay(Duration::from_millis(cfg.app.page_delay_ms)))
    }

    pub fn with_base_url(
        token: String,
        version: String,
        base_url: Url,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent("notion-overdue/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            version,
            page_delay: Duration::ZERO,
        })
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid Notion base URL")?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version);
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", "application/json")
                .json(body);
        }
        builder.build().context("failed to build Notion request")
    }

    /// Execute a request and return the response body, failing on any status >= 400.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<String> {
        let request = self.build_request(method, path, body)?;
        debug!(method=%request.method(), url=%request.url(), "sending notion request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach Notion")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("Rate limited by Notion: {}", body);
            return Err(anyhow!("received 429 from Notion: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("notion error {}: {}", status, body));
        }

        res.text().await.context("failed to read Notion response")
    }

    pub async fn retrieve_database(&self, database_id: &str) -> Result<RetrieveDatabaseResp> {
        let body = self
            .send(Method::GET, &format!("v1/databases/{}", database_id), None)
            .await?;
        serde_json::from_str(&body).context("invalid Notion database response")
    }

    /// Check the configured property names against the loans database schema
    /// and settle an `auto` alert-stage encoding from the property's type.
    pub async fn resolve_property_ids(&self, cfg: &Config) -> Result<NotionIds> {
        let mut ids = cfg.notion_ids();
        let loans = self
            .retrieve_database(&ids.loans_db)
            .await
            .context("failed to retrieve loans database schema")?;

        let lookup = |name: &str| {
            loans.properties.get(name).ok_or_else(|| {
                anyhow!("property '{}' not found in Notion database {}", name, loans.id)
            })
        };
        for name in [&ids.f_title, &ids.f_borrower, &ids.f_borrowed_on] {
            lookup(name.as_str())?;
        }

        let stage_prop = lookup(ids.f_alert_stage.as_str())?;
        let detected = StageEncoding::from_property_type(&stage_prop.typ).ok_or_else(|| {
            anyhow!(
                "property '{}' has unsupported type '{}' (expected select, status or rich_text)",
                ids.f_alert_stage,
                stage_prop.typ
            )
        })?;
        if ids.stage_encoding != StageEncoding::Auto && ids.stage_encoding != detected {
            warn!(
                configured = ?ids.stage_encoding,
                schema = ?detected,
                "alert stage encoding differs from the database schema; using the schema type"
            );
        }
        ids.stage_encoding = detected;
        info!(encoding = ?ids.stage_encoding, "resolved loans database schema");
        Ok(ids)
    }

    pub async fn query_database(&self, database_id: &str, body: Value) -> Result<Vec<Value>> {
        let query = DatabaseQuery {
            client: self,
            database_id,
            body,
        };
        collect_pages(&query, self.page_delay).await
    }
}

#[async_trait]
impl LoanStore for NotionClient {
    async fn fetch_candidates(&self, ids: &NotionIds) -> Result<Vec<BorrowedItem>> {
        let pages = self
            .query_database(&ids.loans_db, build_candidate_query(ids))
            .await
            .context("candidate query failed")?;
        let total = pages.len();
        let items: Vec<BorrowedItem> = pages
            .iter()
            .filter_map(|page| model::parse_loan_page(page, ids))
            .collect();
        if items.len() != total {
            warn!(dropped = total - items.len(), "ignored pages without an id");
        }
        Ok(items)
    }

    async fn patch_alert_stage(&self, ids: &NotionIds, page_id: &str, stage: Stage) -> Result<()> {
        let body = build_stage_patch(ids, stage);
        self.send(Method::PATCH, &format!("v1/pages/{}", page_id), Some(&body))
            .await
            .with_context(|| {
                format!("failed to set alert stage {} on page {}", stage.as_str(), page_id)
            })?;
        // Notion rate limit; writes are spaced like query pages.
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ContactDirectory for NotionClient {
    async fn resolve_email(&self, ids: &NotionIds, user_id: &str) -> Result<Option<String>> {
        let Some(contacts_db) = ids.contacts_db.as_deref() else {
            return Ok(None);
        };
        let body = build_contact_query(ids, user_id);
        let res = self
            .send(Method::POST, &format!("v1/databases/{}/query", contacts_db), Some(&body))
            .await
            .context("contact query failed")?;
        let page: QueryPage = serde_json::from_str(&res).context("invalid Notion query response")?;
        Ok(page
            .results
            .first()
            .and_then(|contact| model::contact_email(contact, ids)))
    }
}

/// Stage property condition in the encoding the database uses.
fn stage_condition(ids: &NotionIds, condition: Value) -> Value {
    let mut filter = Map::new();
    filter.insert("property".into(), json!(ids.f_alert_stage));
    filter.insert(ids.stage_encoding.property_type().into(), condition);
    Value::Object(filter)
}

/// Candidates: a borrower, a borrow date, and not yet at the terminal stage.
pub fn build_candidate_query(ids: &NotionIds) -> Value {
    json!({
        "filter": {
            "and": [
                { "property": ids.f_borrower, "people": { "is_not_empty": true } },
                { "property": ids.f_borrowed_on, "date": { "is_not_empty": true } },
                {
                    "or": [
                        stage_condition(ids, json!({ "is_empty": true })),
                        stage_condition(
                            ids,
                            json!({ "does_not_equal": Stage::terminal().as_str() })
                        ),
                    ]
                }
            ]
        },
        "page_size": PAGE_SIZE,
    })
}

pub fn build_stage_patch(ids: &NotionIds, stage: Stage) -> Value {
    let value = match ids.stage_encoding {
        StageEncoding::RichText => json!({
            "rich_text": [
                {
                    "text": {
                        "content": stage.as_str(),
                    }
                }
            ]
        }),
        StageEncoding::Status => json!({ "status": { "name": stage.as_str() } }),
        StageEncoding::Select | StageEncoding::Auto => {
            json!({ "select": { "name": stage.as_str() } })
        }
    };
    let mut properties = Map::new();
    properties.insert(ids.f_alert_stage.clone(), value);
    json!({ "properties": Value::Object(properties) })
}

pub fn build_contact_query(ids: &NotionIds, user_id: &str) -> Value {
    json!({
        "filter": {
            "property": ids.f_contact_person,
            "people": { "contains": user_id }
        },
        "page_size": 1,
    })
}
