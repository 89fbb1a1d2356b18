use serde::Serialize;
use tollgate_core::config::{AppConfig, LoadOptions};
use tollgate_core::domain::hierarchy::EntityType;
use tollgate_db::{connect_with_config, migrations, DbPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.extend(database_checks(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["database_connectivity", "schema_migrations", "default_hierarchies"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    summarize(checks)
}

fn summarize(checks: Vec<DoctorCheck>) -> DoctorReport {
    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let warned = checks.iter().any(|check| check.status == CheckStatus::Warn);

    let (overall_status, summary) = if failed {
        (CheckStatus::Fail, "doctor: one or more readiness checks failed")
    } else if warned {
        (CheckStatus::Warn, "doctor: ready with warnings")
    } else {
        (CheckStatus::Pass, "doctor: all readiness checks passed")
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

fn database_checks(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: format!("failed to connect to database: {error}"),
                }];
            }
        };

        let mut checks = vec![DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        }];
        checks.push(check_migrations(&pool).await);
        if checks.last().is_some_and(|check| check.status == CheckStatus::Pass) {
            checks.push(check_default_hierarchies(&pool).await);
        }

        pool.close().await;
        checks
    })
}

async fn check_migrations(pool: &DbPool) -> DoctorCheck {
    let known = migrations::MIGRATOR
        .iter()
        .filter(|migration| migration.migration_type.is_up_migration())
        .count() as i64;
    let applied =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(pool)
            .await;

    match applied {
        Ok(applied) if applied >= known => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Pass,
            details: format!("{applied} of {known} migrations applied"),
        },
        Ok(applied) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: format!("{applied} of {known} migrations applied; run `tollgate migrate`"),
        },
        Err(_) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: "schema is not initialized; run `tollgate migrate`".to_string(),
        },
    }
}

/// Submissions without an explicit hierarchy need an active default for their entity type.
async fn check_default_hierarchies(pool: &DbPool) -> DoctorCheck {
    let covered = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT entity_type FROM approval_hierarchy WHERE is_active = 1 AND is_default = 1",
    )
    .fetch_all(pool)
    .await;

    match covered {
        Ok(covered) => {
            let missing = EntityType::ALL
                .into_iter()
                .filter(|entity_type| !covered.iter().any(|tag| tag == entity_type.as_str()))
                .map(|entity_type| entity_type.as_str())
                .collect::<Vec<_>>();
            if missing.is_empty() {
                DoctorCheck {
                    name: "default_hierarchies",
                    status: CheckStatus::Pass,
                    details: "every entity type has an active default hierarchy".to_string(),
                }
            } else {
                DoctorCheck {
                    name: "default_hierarchies",
                    status: CheckStatus::Warn,
                    details: format!("no active default hierarchy for: {}", missing.join(", ")),
                }
            }
        }
        Err(error) => DoctorCheck {
            name: "default_hierarchies",
            status: CheckStatus::Fail,
            details: format!("failed to read hierarchies: {error}"),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::{render_human, summarize, CheckStatus, DoctorCheck};

    fn check(name: &'static str, status: CheckStatus) -> DoctorCheck {
        DoctorCheck { name, status, details: String::new() }
    }

    #[test]
    fn warnings_do_not_fail_the_report() {
        let report = summarize(vec![
            check("config_validation", CheckStatus::Pass),
            check("default_hierarchies", CheckStatus::Warn),
        ]);
        assert_eq!(report.overall_status, CheckStatus::Warn);
    }

    #[test]
    fn skipped_checks_fail_the_report() {
        let report = summarize(vec![
            check("config_validation", CheckStatus::Fail),
            check("database_connectivity", CheckStatus::Skipped),
        ]);
        assert_eq!(report.overall_status, CheckStatus::Fail);
        assert!(render_human(&report).contains("- [skip] database_connectivity"));
    }
}
