//! One sweep over the loans database.
use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{error, info, instrument, warn};

use crate::escalation::{self, Applied};
use crate::notifier::{Delivery, Notifier};
use crate::notion::{ContactDirectory, LoanStore, NotionIds};

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub today: NaiveDate,
    /// Classify and log only; nothing is sent or written.
    pub dry_run: bool,
    pub admin_email: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub candidates: usize,
    pub applied: Vec<Applied>,
    /// Transitions found in a dry run.
    pub planned: Vec<String>,
    /// Records whose stage write-back failed.
    pub failed: usize,
}

impl SweepReport {
    pub fn summary_lines(&self) -> Vec<&str> {
        self.applied.iter().map(|a| a.summary_line.as_str()).collect()
    }

    /// Final console line.
    pub fn describe(&self) -> String {
        if !self.planned.is_empty() {
            return format!(
                "Dry run: {} transition(s) pending across {} candidate(s).",
                self.planned.len(),
                self.candidates
            );
        }
        if self.applied.is_empty() && self.failed == 0 {
            return format!("No escalations due ({} candidate(s) checked).", self.candidates);
        }
        let mut line = format!(
            "Applied {} transition(s) across {} candidate(s).",
            self.applied.len(),
            self.candidates
        );
        if self.failed > 0 {
            line.push_str(&format!(
                " {} record(s) failed and will be retried next sweep.",
                self.failed
            ));
        }
        line
    }
}

/// Subject and text of the batch summary sent to the administrator and the channel.
pub fn batch_message(lines: &[&str], today: NaiveDate) -> (String, String) {
    let subject = format!(
        "[Library] {} overdue loan notice(s) on {}",
        lines.len(),
        today.format("%Y-%m-%d")
    );
    let text = format!("📚 Overdue loan escalations ({})\n{}", lines.len(), lines.join("\n"));
    (subject, text)
}

/// Fetch candidates once, apply every due transition, then send the batch summary.
///
/// Only the candidate fetch can fail the sweep. Per-record and per-recipient
/// failures are logged and counted.
#[instrument(skip_all, fields(today = %opts.today, dry_run = opts.dry_run))]
pub async fn run(
    ids: &NotionIds,
    store: &dyn LoanStore,
    contacts: &dyn ContactDirectory,
    notifier: &dyn Notifier,
    opts: &SweepOptions,
) -> Result<SweepReport> {
    let candidates = store
        .fetch_candidates(ids)
        .await
        .context("failed to fetch candidate records")?;
    info!(count = candidates.len(), "fetched candidates");

    let mut report = SweepReport {
        candidates: candidates.len(),
        ..Default::default()
    };

    for record in &candidates {
        let Some(transition) = escalation::classify(record, opts.today) else {
            continue;
        };
        if opts.dry_run {
            let line = escalation::summary_line(&transition);
            info!(record = %record.id, from = transition.from.as_str(), "{}", line);
            report.planned.push(line);
            continue;
        }
        match escalation::apply(&transition, ids, store, contacts, notifier).await {
            Ok(applied) => report.applied.push(applied),
            Err(err) => {
                report.failed += 1;
                error!(?err, record = %record.id, "escalation failed; will retry next sweep");
            }
        }
    }

    let lines = report.summary_lines();
    if lines.is_empty() {
        return Ok(report);
    }
    let (subject, text) = batch_message(&lines, opts.today);

    if let Some(admin) = opts.admin_email.as_deref() {
        match notifier.send_direct(admin, &subject, &text).await {
            Ok(Delivery::Sent) => info!(to = %admin, "administrator summary sent"),
            Ok(Delivery::Disabled) => {}
            Err(err) => warn!(?err, to = %admin, "administrator summary failed"),
        }
    }
    match notifier.send_broadcast(&text).await {
        Ok(Delivery::Sent) => info!("broadcast summary sent"),
        Ok(Delivery::Disabled) => {}
        Err(err) => warn!(?err, "broadcast summary failed"),
    }

    Ok(report)
}
