//! Minute-granularity cron scheduler for recurring operations.
//!
//! Checks every 30 seconds whether a job's cron expression matches the
//! current minute; a last-run stamp stops the same minute from firing twice.
//! An empty cron expression disables the job.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::{error, info, warn};

use shep_ops::{Initiator, Orchestrator};

const CHECK_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Ziplogs,
}

impl JobKind {
    fn name(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Ziplogs => "ziplogs",
        }
    }
}

struct Job {
    kind: JobKind,
    cron: String,
    last_run: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    orch: Arc<Orchestrator>,
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new(orch: Arc<Orchestrator>) -> Self {
        let backup_cron = orch.cfg.backup_cron.clone();
        let ziplogs_cron = orch.cfg.ziplogs_cron.clone();
        Self {
            orch,
            jobs: vec![
                Job {
                    kind: JobKind::Backup,
                    cron: backup_cron,
                    last_run: None,
                },
                Job {
                    kind: JobKind::Ziplogs,
                    cron: ziplogs_cron,
                    last_run: None,
                },
            ],
        }
    }

    pub async fn run(mut self) {
        info!("Scheduler started");
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(CHECK_INTERVAL_SECS)).await;
            self.tick(Utc::now()).await;
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        for job in &mut self.jobs {
            if !job_due(&job.cron, job.last_run, &now) {
                continue;
            }
            job.last_run = Some(now);
            info!(job = job.kind.name(), "Running scheduled job");
            run_job(&self.orch, job.kind).await;
        }
    }
}

async fn run_job(orch: &Orchestrator, kind: JobKind) {
    let result = match kind {
        JobKind::Backup => orch.backup(Initiator::Scheduled).await,
        JobKind::Ziplogs => orch.ziplogs(Initiator::Scheduled).await,
    };
    match result {
        Ok(report) if report.is_ok() => {
            info!(job = kind.name(), "Scheduled job finished");
        }
        Ok(report) => {
            warn!(
                job = kind.name(),
                error = report.error.as_deref().unwrap_or("unknown"),
                "Scheduled job failed"
            );
        }
        Err(e) => {
            error!(job = kind.name(), error = %e, "Scheduled job refused");
        }
    }
}

/// True when `cron` matches `now`'s minute and the job has not already run
/// this minute.
fn job_due(cron: &str, last_run: Option<DateTime<Utc>>, now: &DateTime<Utc>) -> bool {
    if cron.trim().is_empty() {
        return false;
    }
    if let Some(last) = last_run {
        if last.format("%Y-%m-%d %H:%M").to_string() == now.format("%Y-%m-%d %H:%M").to_string() {
            return false;
        }
    }
    cron_matches(cron, now)
}

/// Standard 5-field cron: minute hour day-of-month month day-of-week.
fn cron_matches(cron: &str, now: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = cron.trim().split_whitespace().collect();
    if fields.len() != 5 {
        warn!(cron, "Invalid cron expression");
        return false;
    }

    cron_field_matches(fields[0], now.minute())
        && cron_field_matches(fields[1], now.hour())
        && cron_field_matches(fields[2], now.day())
        && cron_field_matches(fields[3], now.month())
        // chrono Monday=1..Sunday=7; cron Sunday=0.
        && cron_field_matches(fields[4], now.weekday().number_from_monday() % 7)
}

/// Match a single cron field against a value. Supports: *, */n, n, n-m, n,m,o
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }

    if let Some(step_str) = field.strip_prefix("*/") {
        if let Ok(step) = step_str.parse::<u32>() {
            return step > 0 && value % step == 0;
        }
        return false;
    }

    for part in field.split(',') {
        if let Some((start_str, end_str)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_str.parse::<u32>(), end_str.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(exact) = part.parse::<u32>() {
            if value == exact {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_cron_wildcard() {
        assert!(cron_field_matches("*", 0));
        assert!(cron_field_matches("*", 30));
    }

    #[test]
    fn test_cron_exact() {
        assert!(cron_field_matches("30", 30));
        assert!(!cron_field_matches("30", 31));
    }

    #[test]
    fn test_cron_step() {
        assert!(cron_field_matches("*/5", 0));
        assert!(cron_field_matches("*/5", 15));
        assert!(!cron_field_matches("*/5", 13));
    }

    #[test]
    fn test_cron_range_and_list() {
        assert!(cron_field_matches("1-5", 3));
        assert!(!cron_field_matches("1-5", 6));
        assert!(cron_field_matches("1,3,5", 3));
        assert!(!cron_field_matches("1,3,5", 4));
    }

    #[test]
    fn test_nightly_expression() {
        assert!(cron_matches("0 0 * * *", &at(0, 0)));
        assert!(!cron_matches("0 0 * * *", &at(0, 1)));
        assert!(!cron_matches("0 0 * * *", &at(12, 0)));
    }

    #[test]
    fn test_empty_cron_disables_job() {
        assert!(!job_due("", None, &at(0, 0)));
        assert!(!job_due("   ", None, &at(0, 0)));
    }

    #[test]
    fn test_same_minute_runs_once() {
        let now = at(0, 0);
        assert!(job_due("0 0 * * *", None, &now));
        assert!(!job_due("0 0 * * *", Some(now), &now));
        // Next day it fires again.
        let tomorrow = Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 10).unwrap();
        assert!(job_due("0 0 * * *", Some(now), &tomorrow));
    }
}
