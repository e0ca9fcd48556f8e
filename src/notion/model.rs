//! Notion wire models and property extraction for loan and contact pages.
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::model::{BorrowedItem, Borrower};
use crate::notion::NotionIds;

#[derive(Deserialize, Debug)]
pub struct DatabaseProperty {
    pub id: String,
    #[serde(rename = "type")]
    pub typ: String,
}

#[derive(Deserialize, Debug)]
pub struct RetrieveDatabaseResp {
    pub id: String,
    #[serde(default)]
    pub title: Vec<Value>,
    pub properties: std::collections::HashMap<String, DatabaseProperty>,
}

/// One page of a database query.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct QueryPage {
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email regex")
});

/// Concatenated `plain_text` of a rich-text or title array.
fn plain_text(items: &Value) -> String {
    items
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    t.get("plain_text")
                        .or_else(|| t.get("text").and_then(|x| x.get("content")))
                        .and_then(Value::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn property<'a>(page: &'a Value, name: &str) -> Option<&'a Value> {
    page.get("properties").and_then(|p| p.get(name))
}

/// Text value of a select, status, rich_text or title property, regardless of which it is.
pub fn text_value(prop: &Value) -> String {
    match prop.get("type").and_then(Value::as_str) {
        Some(typ @ ("select" | "status")) => prop
            .get(typ)
            .and_then(|o| o.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        Some("rich_text") => plain_text(&prop["rich_text"]),
        Some("title") => plain_text(&prop["title"]),
        _ => String::new(),
    }
}

fn page_title(page: &Value, field: &str) -> String {
    let named = property(page, field).map(text_value).unwrap_or_default();
    if !named.is_empty() {
        return named;
    }
    page.get("properties")
        .and_then(Value::as_object)
        .and_then(|props| {
            props
                .values()
                .filter(|v| v.get("type").and_then(Value::as_str) == Some("title"))
                .map(|v| plain_text(&v["title"]))
                .find(|t| !t.is_empty())
        })
        .unwrap_or_else(|| BorrowedItem::UNTITLED.to_string())
}

fn borrowers(prop: Option<&Value>) -> Vec<Borrower> {
    let people = match prop.and_then(|p| p.get("people")).and_then(Value::as_array) {
        Some(people) => people,
        None => return Vec::new(),
    };
    people
        .iter()
        .filter_map(|person| {
            let user_id = person.get("id").and_then(Value::as_str)?.to_string();
            let name = person
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            let email = person
                .get("person")
                .and_then(|p| p.get("email"))
                .and_then(Value::as_str)
                .and_then(extract_address);
            Some(Borrower { user_id, name, email })
        })
        .collect()
}

/// Calendar date from a date property; date-times are cut to their date part.
fn date_value(prop: Option<&Value>) -> Option<NaiveDate> {
    let start = prop?.get("date")?.get("start")?.as_str()?;
    let day = start.get(..10).unwrap_or(start);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Map a loans-database page into a `BorrowedItem`. Pages without an id are dropped.
pub fn parse_loan_page(page: &Value, ids: &NotionIds) -> Option<BorrowedItem> {
    let id = page.get("id").and_then(Value::as_str)?.to_string();
    Some(BorrowedItem {
        title: page_title(page, &ids.f_title),
        url: page
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        borrowers: borrowers(property(page, &ids.f_borrower)),
        borrowed_on: date_value(property(page, &ids.f_borrowed_on)),
        alert_stage: property(page, &ids.f_alert_stage)
            .map(text_value)
            .unwrap_or_default(),
        id,
    })
}

/// First address-looking substring of `raw`.
pub fn extract_address(raw: &str) -> Option<String> {
    EMAIL_RE.find(raw).map(|m| m.as_str().to_string())
}

/// Address from a contacts page: typed email property first, then the free-text one.
pub fn contact_email(page: &Value, ids: &NotionIds) -> Option<String> {
    let typed = property(page, &ids.f_contact_email)
        .and_then(|p| p.get("email"))
        .and_then(Value::as_str)
        .and_then(extract_address);
    typed.or_else(|| {
        property(page, &ids.f_contact_email_text)
            .map(text_value)
            .as_deref()
            .and_then(extract_address)
    })
}
