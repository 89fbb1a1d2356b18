use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tollgate_core::notify::InMemoryNotifier;
use tollgate_db::{ApprovalWorkflow, SweepReport};

use crate::commands::{load_config, migrated_pool, runtime, CommandResult, StepError};

/// Expires every in-progress request whose current level has timed out as of `at`
/// (now when absent).
pub fn run(at: Option<&str>) -> CommandResult {
    let now = match parse_instant(at) {
        Ok(now) => now,
        Err(message) => return CommandResult::failure("sweep", "invalid_argument", message, 2),
    };
    let config = match load_config("sweep") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match runtime("sweep") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let notifier = InMemoryNotifier::default();
    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let workflow =
            ApprovalWorkflow::from_pool(pool.clone(), &config.workflow, Arc::new(notifier.clone()));
        let report: Result<_, StepError> = workflow
            .sweep_timeouts(now)
            .await
            .map_err(|error| ("sweep_execution", error.to_string(), 6u8));
        pool.close().await;
        report
    });

    match result {
        Ok(report) => {
            let notifications = notifier
                .notifications()
                .into_iter()
                .map(|notification| {
                    json!({
                        "kind": notification.kind.as_str(),
                        "requestId": notification.request_id.0,
                        "recipients": notification.recipients,
                    })
                })
                .collect::<Vec<_>>();
            report_outcome(now, report, notifications)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sweep", error_class, message, exit_code)
        }
    }
}

/// A sweep with failed requests exits 7 but still reports what it did.
fn report_outcome(
    now: DateTime<Utc>,
    report: SweepReport,
    notifications: Vec<Value>,
) -> CommandResult {
    let mut message = format!(
        "scanned {} in-progress requests, expired {}, failed {}",
        report.scanned, report.expired, report.failed
    );
    let partial = report.failed > 0;
    if partial {
        let ids = report.failed_request_ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>();
        message.push_str(&format!(" ({})", ids.join(", ")));
    }

    let details = Some(json!({
        "asOf": now.to_rfc3339(),
        "report": report,
        "notifications": notifications,
    }));
    if partial {
        return CommandResult::failure_with_details("sweep", "sweep_partial", message, 7, details);
    }
    CommandResult::success_with_details("sweep", message, details)
}

fn parse_instant(at: Option<&str>) -> Result<DateTime<Utc>, String> {
    match at {
        None => Ok(Utc::now()),
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|instant| instant.with_timezone(&Utc))
            .map_err(|error| format!("`--at` must be an RFC 3339 timestamp: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use tollgate_core::domain::request::ApprovalRequestId;
    use tollgate_db::SweepReport;

    use super::{parse_instant, report_outcome};

    #[test]
    fn parse_instant_normalizes_offsets_to_utc() {
        let parsed = parse_instant(Some("2026-03-01T12:00:00+02:00")).expect("parse");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("date"));
    }

    #[test]
    fn parse_instant_rejects_garbage() {
        let error = parse_instant(Some("next tuesday")).expect_err("invalid");
        assert!(error.contains("--at"));
    }

    #[test]
    fn partial_sweep_names_the_requests_that_failed() {
        let report = SweepReport {
            scanned: 3,
            expired: 1,
            failed: 1,
            failed_request_ids: vec![ApprovalRequestId("APR-9".to_string())],
        };
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().expect("date");

        let result = report_outcome(now, report, Vec::new());
        assert_eq!(result.exit_code, 7);
        let payload: Value = serde_json::from_str(&result.output).expect("json");
        assert_eq!(payload["error_class"], "sweep_partial");
        assert_eq!(payload["message"], "scanned 3 in-progress requests, expired 1, failed 1 (APR-9)");
        assert_eq!(payload["details"]["report"]["expired"], 1);
        assert_eq!(payload["details"]["report"]["failedRequestIds"][0], "APR-9");
    }
}
