use crate::application::dispatcher::{
    CleanupAction, CleanupReport, DispatchOutcome, DispatchReport,
};
use crate::application::reconciler::{ReconcileOutcome, ReconcileReport};
use crate::application::sweeper::{SweepOutcome, SweepReport};
use crate::error::Result;
use std::io::Write;

/// Writes run reports as CSV, one row per item.
///
/// Headers are written even for empty reports so downstream tooling always
/// sees a well-formed file.
pub struct ReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReportWriter<W> {
    pub fn new(sink: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(sink);
        Self { writer }
    }

    pub fn write_reconcile(&mut self, report: &ReconcileReport) -> Result<()> {
        self.writer
            .write_record(["session_id", "outcome", "subject", "detail"])?;
        for (session_id, outcome) in &report.items {
            let (name, subject, detail) = match outcome {
                ReconcileOutcome::Advanced { commission_id } => {
                    ("advanced", commission_id.to_string(), String::new())
                }
                ReconcileOutcome::Recorded {
                    commission_id,
                    status,
                } => ("recorded", commission_id.to_string(), status.to_string()),
                ReconcileOutcome::Credited { payee_id, entry_id } => {
                    ("credited", payee_id.to_string(), entry_id.to_string())
                }
                ReconcileOutcome::Duplicate => ("duplicate", String::new(), String::new()),
                ReconcileOutcome::Dropped { reason } => ("dropped", String::new(), reason.clone()),
                ReconcileOutcome::Failed { error } => ("failed", String::new(), error.clone()),
            };
            self.writer
                .write_record([session_id.as_str(), name, subject.as_str(), detail.as_str()])?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_dispatch(&mut self, report: &DispatchReport) -> Result<()> {
        self.writer
            .write_record(["payee_id", "entry_id", "amount", "outcome", "detail"])?;
        for item in &report.items {
            let (name, detail) = match &item.outcome {
                DispatchOutcome::Transferred { transfer_id } => ("transferred", transfer_id.clone()),
                DispatchOutcome::Failed { error } => ("failed", error.clone()),
                DispatchOutcome::Deferred { needed, remaining } => {
                    ("deferred", format!("needed {needed}, remaining {remaining}"))
                }
                DispatchOutcome::HeldForReview { reason } => ("held_for_review", reason.clone()),
                DispatchOutcome::Invalid => ("invalid", String::new()),
            };
            self.writer.write_record([
                item.payee_id.to_string(),
                item.entry_id.to_string(),
                item.amount.to_string(),
                name.to_string(),
                detail,
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_sweep(&mut self, report: &SweepReport) -> Result<()> {
        self.writer
            .write_record(["commission_id", "expired_at", "outcome", "detail"])?;
        for item in &report.items {
            let (name, detail) = match &item.outcome {
                SweepOutcome::Refunded { refund_id } => ("refunded", refund_id.clone()),
                SweepOutcome::CancelledUncaptured => ("cancelled_uncaptured", String::new()),
                SweepOutcome::CancelledUnpaid => ("cancelled_unpaid", String::new()),
                SweepOutcome::RefundFailed { error } => ("refund_failed", error.clone()),
                SweepOutcome::Failed { error } => ("failed", error.clone()),
            };
            self.writer.write_record([
                item.commission_id.to_string(),
                item.expired_at.to_rfc3339(),
                name.to_string(),
                detail,
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_cleanup(&mut self, report: &CleanupReport) -> Result<()> {
        self.writer
            .write_record(["payee_id", "entry_id", "amount", "action"])?;
        for item in &report.items {
            let action = match item.action {
                CleanupAction::RemovedInvalid => "removed_invalid",
                CleanupAction::RemovedDuplicate => "removed_duplicate",
                CleanupAction::FlaggedStale => "flagged_stale",
            };
            self.writer.write_record([
                item.payee_id.to_string(),
                item.entry_id.to_string(),
                item.amount.to_string(),
                action.to_string(),
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
