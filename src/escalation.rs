//! Staged escalation: decide which overdue loans need a new notice, send it,
//! and record the stage on the loan page.
//!
//! [`classify`] is a pure function of the record and a reference date.
//! [`apply`] performs the side effects for one transition: one direct message
//! per reachable borrower, then exactly one stage write-back.
use anyhow::Result;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{info, instrument, warn};

use crate::model::{BorrowedItem, Borrower, Stage};
use crate::notifier::{Delivery, Notifier};
use crate::notion::{ContactDirectory, LoanStore, NotionIds};

/// A computed, not yet applied, stage upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<'a> {
    pub record: &'a BorrowedItem,
    pub from: Stage,
    pub to: Stage,
    pub days: i64,
}

/// Outcome of one applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub record_id: String,
    pub title: String,
    pub from: Stage,
    pub to: Stage,
    pub days: i64,
    pub recipients_notified: usize,
    pub delivery_failures: usize,
    pub unresolved_borrowers: Vec<String>,
    pub summary_line: String,
}

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder regex"));

struct Template {
    subject: &'static str,
    body: &'static str,
}

fn template(stage: Stage) -> Option<Template> {
    match stage {
        Stage::Unnotified => None,
        Stage::Week3 => Some(Template {
            subject: "[Library] \"{title}\" is due back soon",
            body: "Hello {borrower_names},\n\n\
                   \"{title}\" was borrowed on {borrowed_on}, {days} days ago.\n\
                   The loan period ends after 4 weeks, so please plan to return it \
                   within the next week.\n\n\
                   Record: {record_url}\n",
        }),
        Stage::Week4 => Some(Template {
            subject: "[Library] \"{title}\" is overdue, please return it",
            body: "Hello {borrower_names},\n\n\
                   \"{title}\" was borrowed on {borrowed_on} and has now been out \
                   for {days} days,\n\
                   past the 4 week loan period. Please return it as soon as possible.\n\n\
                   Record: {record_url}\n",
        }),
    }
}

/// Elapsed whole days from `borrowed_on` to `today`; a future borrow date counts as 0.
pub fn days_elapsed(borrowed_on: NaiveDate, today: NaiveDate) -> i64 {
    (today - borrowed_on).num_days().max(0)
}

/// Decide whether `record` needs a notice on `today`.
pub fn classify(record: &BorrowedItem, today: NaiveDate) -> Option<Transition<'_>> {
    let borrowed_on = record.borrowed_on?;
    let days = days_elapsed(borrowed_on, today);
    let target = Stage::for_days(days);
    if target == Stage::Unnotified {
        return None;
    }
    let current = Stage::parse(&record.alert_stage);
    if target <= current {
        return None;
    }
    Some(Transition {
        record,
        from: current,
        to: target,
        days,
    })
}

/// Rendered subject and body for a transition's target stage.
pub fn render(transition: &Transition<'_>) -> (String, String) {
    let Some(tpl) = template(transition.to) else {
        return (String::new(), String::new());
    };
    let record = transition.record;
    let borrowed_on = record
        .borrowed_on
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let url = if record.url.is_empty() { "-" } else { record.url.as_str() };
    let days = transition.days.to_string();
    let names = record.borrower_names();
    // Single pass, so placeholders inside substituted values stay literal.
    let fill = |text: &str| {
        PLACEHOLDER_RE
            .replace_all(text, |caps: &Captures<'_>| match &caps[1] {
                "title" => record.title.clone(),
                "borrowed_on" => borrowed_on.clone(),
                "days" => days.clone(),
                "borrower_names" => names.clone(),
                "record_url" => url.to_string(),
                _ => caps[0].to_string(),
            })
            .into_owned()
    };
    (fill(tpl.subject), fill(tpl.body))
}

/// One line for the batch summary.
pub fn summary_line(transition: &Transition<'_>) -> String {
    let record = transition.record;
    let mut line = format!(
        "- [{}] {} / borrower: {} / {} days",
        transition.to.as_str(),
        record.title,
        record.borrower_names(),
        transition.days
    );
    if !record.url.is_empty() {
        line.push_str(" / ");
        line.push_str(&record.url);
    }
    line
}

async fn resolve_recipient(
    contacts: &dyn ContactDirectory,
    ids: &NotionIds,
    borrower: &Borrower,
) -> Option<String> {
    match contacts.resolve_email(ids, &borrower.user_id).await {
        Ok(Some(address)) => return Some(address),
        Ok(None) => {}
        Err(err) => {
            warn!(?err, user = %borrower.user_id, "contact lookup failed");
        }
    }
    borrower.email.clone()
}

/// Notify every reachable borrower, then write the new stage once.
///
/// Delivery failures and unresolved borrowers are logged and do not stop the
/// stage from advancing. A failed write-back is returned as an error; the
/// record stays a candidate for the next sweep.
#[instrument(skip_all, fields(record = %transition.record.id, stage = transition.to.as_str()))]
pub async fn apply(
    transition: &Transition<'_>,
    ids: &NotionIds,
    store: &dyn LoanStore,
    contacts: &dyn ContactDirectory,
    notifier: &dyn Notifier,
) -> Result<Applied> {
    let record = transition.record;
    let (subject, body) = render(transition);
    let mut recipients_notified = 0;
    let mut delivery_failures = 0;
    let mut unresolved_borrowers = Vec::new();

    for borrower in &record.borrowers {
        let Some(address) = resolve_recipient(contacts, ids, borrower).await else {
            warn!(
                user = %borrower.user_id,
                borrower = %borrower.name,
                "no email address for borrower; skipping"
            );
            unresolved_borrowers.push(borrower.name.clone());
            continue;
        };
        match notifier.send_direct(&address, &subject, &body).await {
            Ok(Delivery::Sent) => {
                recipients_notified += 1;
                info!(to = %address, "borrower notified");
            }
            Ok(Delivery::Disabled) => {}
            Err(err) => {
                delivery_failures += 1;
                warn!(?err, to = %address, "borrower notice failed");
            }
        }
    }

    store
        .patch_alert_stage(ids, &record.id, transition.to)
        .await?;
    info!(
        from = transition.from.as_str(),
        days = transition.days,
        recipients_notified,
        delivery_failures,
        "stage advanced"
    );

    Ok(Applied {
        record_id: record.id.clone(),
        title: record.title.clone(),
        from: transition.from,
        to: transition.to,
        days: transition.days,
        recipients_notified,
        delivery_failures,
        unresolved_borrowers,
        summary_line: summary_line(transition),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn record(days_ago: i64, stage: &str) -> BorrowedItem {
        BorrowedItem {
            id: "page-1".into(),
            title: "Dune".into(),
            url: "https://www.notion.so/dune".into(),
            borrowers: vec![Borrower {
                user_id: "u-1".into(),
                name: "Kim".into(),
                email: None,
            }],
            borrowed_on: Some(today() - chrono::Duration::days(days_ago)),
            alert_stage: stage.into(),
        }
    }

    #[test]
    fn nothing_before_three_weeks() {
        for days in 0..21 {
            assert!(classify(&record(days, ""), today()).is_none(), "day {days}");
        }
    }

    #[test]
    fn week3_window_from_unnotified() {
        for days in 21..=27 {
            let rec = record(days, "");
            let t = classify(&rec, today()).unwrap();
            assert_eq!(t.from, Stage::Unnotified);
            assert_eq!(t.to, Stage::Week3);
            assert_eq!(t.days, days);
        }
    }

    #[test]
    fn week4_from_any_lower_stage() {
        for days in [28, 30, 45, 365] {
            for stage in ["", "WEEK_3", "garbage"] {
                let rec = record(days, stage);
                let t = classify(&rec, today()).unwrap();
                assert_eq!(t.to, Stage::Week4);
            }
        }
        // Straight from unnotified, skipping week 3.
        let rec = record(30, "");
        assert_eq!(classify(&rec, today()).unwrap().from, Stage::Unnotified);
    }

    #[test]
    fn terminal_and_same_stage_are_noops() {
        assert!(classify(&record(40, "WEEK_4"), today()).is_none());
        assert!(classify(&record(22, "WEEK_3"), today()).is_none());
        // A week-4 label never goes back to week 3.
        assert!(classify(&record(22, "WEEK_4"), today()).is_none());
    }

    #[test]
    fn missing_date_and_future_date() {
        let mut rec = record(30, "");
        rec.borrowed_on = None;
        assert!(classify(&rec, today()).is_none());

        let rec = record(-5, "");
        assert!(classify(&rec, today()).is_none());
        assert_eq!(days_elapsed(today() + chrono::Duration::days(3), today()), 0);
    }

    #[test]
    fn classify_is_idempotent_once_label_written() {
        let mut rec = record(23, "");
        let to = classify(&rec, today()).unwrap().to;
        rec.alert_stage = to.as_str().into();
        assert!(classify(&rec, today()).is_none());

        // Next boundary brings the next stage.
        let later = today() + chrono::Duration::days(5);
        assert_eq!(classify(&rec, later).unwrap().to, Stage::Week4);
    }

    #[test]
    fn stage_never_decreases_over_daily_sweeps() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut rec = record(0, "");
        rec.borrowed_on = Some(start);
        let mut last = Stage::Unnotified;
        let mut notices = Vec::new();
        for offset in 0..60 {
            let day = start + chrono::Duration::days(offset);
            if let Some(t) = classify(&rec, day) {
                assert!(t.to > last);
                notices.push((offset, t.to));
                last = t.to;
                rec.alert_stage = t.to.as_str().into();
            }
        }
        assert_eq!(notices, vec![(21, Stage::Week3), (28, Stage::Week4)]);
    }

    #[test]
    fn render_fills_placeholders() {
        let rec = record(30, "WEEK_3");
        let t = classify(&rec, today()).unwrap();
        let (subject, body) = render(&t);
        assert!(subject.contains("\"Dune\" is overdue"));
        assert!(body.contains("Hello Kim"));
        assert!(body.contains("borrowed on 2024-05-31"));
        assert!(body.contains("out for 30 days"));
        assert!(body.contains("https://www.notion.so/dune"));
        assert!(!body.contains('{'));

        let rec = record(21, "");
        let (subject, _) = render(&classify(&rec, today()).unwrap());
        assert!(subject.contains("due back soon"));
    }

    #[test]
    fn render_keeps_braces_in_record_data() {
        let mut rec = record(21, "");
        rec.title = "Cookbook {days} {record_url}".into();
        rec.borrowers[0].name = "{title}".into();
        let (subject, body) = render(&classify(&rec, today()).unwrap());
        assert_eq!(
            subject,
            "[Library] \"Cookbook {days} {record_url}\" is due back soon"
        );
        assert!(body.starts_with("Hello {title},"));
        assert!(body.contains("21 days ago"));
    }

    #[test]
    fn summary_line_format() {
        let mut rec = record(21, "");
        let line = summary_line(&classify(&rec, today()).unwrap());
        assert_eq!(
            line,
            "- [WEEK_3] Dune / borrower: Kim / 21 days / https://www.notion.so/dune"
        );
        rec.url.clear();
        let line = summary_line(&classify(&rec, today()).unwrap());
        assert!(line.ends_with("21 days"));
    }
}
