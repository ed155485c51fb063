//! Bulk dispatch: one spreadsheet, one message template, many sends.

use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use wasend_core::{
    config::DispatchConfig,
    dispatch::{DispatchReport, RecipientFailure},
    error::WasendError,
    traits::DeviceClient,
};
use wasend_sheets::{parse_recipients, render_template, Recipient};

use crate::session::LinkSession;

const TIMED_OUT: &str = "dispatch timed out";

/// Runs bulk sends against linked sessions.
pub struct DispatchService {
    send_interval: Duration,
    timeout: Duration,
}

impl DispatchService {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            send_interval: config.send_interval(),
            timeout: config.timeout(),
        }
    }

    /// Send `message` to every recipient row of `file`.
    ///
    /// Returns the report when at least one message went out. When every
    /// recipient failed the report is carried by `WasendError::SendFailed`.
    /// The session's link state is never changed by a dispatch.
    pub async fn submit(
        &self,
        session: &LinkSession,
        message: &str,
        file: Vec<u8>,
    ) -> Result<DispatchReport, WasendError> {
        if !session.is_linked().await {
            return Err(WasendError::NotLinked);
        }
        if message.trim().is_empty() {
            return Err(WasendError::InvalidInput("message is required".into()));
        }
        if file.is_empty() {
            return Err(WasendError::InvalidInput("file is required".into()));
        }

        let _slot = session.try_begin_dispatch()?;

        let sheet = tokio::task::spawn_blocking(move || parse_recipients(&file))
            .await
            .map_err(|e| WasendError::Spreadsheet(format!("spreadsheet parser crashed: {e}")))??;

        info!(
            session = %session.id(),
            rows = sheet.recipients.len(),
            valid = sheet.valid_count(),
            "bulk send accepted"
        );

        let report = self
            .deliver(session.device(), message, &sheet.recipients)
            .await;

        info!(
            session = %session.id(),
            job_id = %report.job_id,
            total = report.total,
            sent = report.sent,
            failed = report.failed,
            "bulk send finished"
        );

        if report.sent == 0 {
            return Err(WasendError::SendFailed {
                message: report.summary(),
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// Deliver sequentially, pausing between sends, within the job deadline.
    pub(crate) async fn deliver(
        &self,
        device: &dyn DeviceClient,
        template: &str,
        recipients: &[Recipient],
    ) -> DispatchReport {
        let job_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = Instant::now() + self.timeout;

        let mut sent = 0;
        let mut failures = Vec::new();
        let mut attempted = false;

        for recipient in recipients {
            let fail = |error: &str| RecipientFailure {
                row: recipient.row,
                phone: recipient.phone.clone(),
                error: error.to_string(),
            };

            if let Some(problem) = &recipient.problem {
                failures.push(fail(problem));
                continue;
            }

            if attempted && !self.send_interval.is_zero() {
                tokio::time::sleep_until(deadline.min(Instant::now() + self.send_interval)).await;
            }
            if Instant::now() >= deadline {
                failures.push(fail(TIMED_OUT));
                continue;
            }
            attempted = true;

            let text = render_template(template, &recipient.fields);
            match tokio::time::timeout_at(deadline, device.send_text(&recipient.phone, &text)).await
            {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => {
                    warn!(%job_id, row = recipient.row, "send failed: {e}");
                    failures.push(fail(&e.to_string()));
                }
                Err(_) => {
                    warn!(%job_id, row = recipient.row, "send interrupted by job deadline");
                    failures.push(fail(TIMED_OUT));
                }
            }
        }

        DispatchReport {
            job_id,
            total: recipients.len(),
            sent,
            failed: failures.len(),
            failures,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
