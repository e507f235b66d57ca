//! Parser for `srvadmin status -v` output.
//!
//! The output interleaves three kinds of lines:
//!
//! ```text
//! 'Server Repository Database' (1764) is running.
//! Status: RUNNING
//! worker-1:
//! Connection error contacting worker 1
//! ```
//!
//! Quoted lines are per-process rows, `Status:` lines carry the aggregate
//! for the current section, a trailing-colon line switches the section to
//! another host, and anything else inside a section is recorded as an error
//! row with pid -1.

use shep_store::ProcessRow;
use tracing::warn;

pub struct ParsedStatus {
    pub rows: Vec<ProcessRow>,
    /// Aggregate across sections. The first `Status:` wins, except that a
    /// `DEGRADED` anywhere overrides.
    pub aggregate: Option<String>,
}

/// Parse status output. Rows start out attributed to `primary`; section
/// headers switch attribution via `resolve_host`, and rows in a section
/// whose host is unknown are dropped.
pub fn parse_status_output<F>(stdout: &str, primary: &str, resolve_host: F) -> ParsedStatus
where
    F: Fn(&str) -> Option<String>,
{
    let mut rows = Vec::new();
    let mut aggregate: Option<String> = None;
    let mut agent: Option<String> = Some(primary.to_string());

    for raw in stdout.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(row) = parse_process_line(line) {
            match &agent {
                Some(agent) => rows.push(ProcessRow {
                    agent: agent.clone(),
                    name: row.0,
                    pid: row.1,
                    status: row.2,
                }),
                None => warn!(line, "Dropping process row for unknown host"),
            }
        } else if let Some(status) = line.strip_prefix("Status:") {
            let status = status.trim().to_string();
            if let Some(agent) = &agent {
                rows.push(ProcessRow {
                    agent: agent.clone(),
                    name: "Status".to_string(),
                    pid: 0,
                    status: status.clone(),
                });
            }
            if aggregate.is_none() || status == "DEGRADED" {
                aggregate = Some(status);
            }
        } else if let Some(host) = line.strip_suffix(':') {
            agent = resolve_host(host);
            if agent.is_none() {
                warn!(host, "Status section for unknown host");
            }
        } else {
            // Free-form diagnostic, e.g. "Connection error contacting worker 1".
            match &agent {
                Some(agent) => rows.push(ProcessRow {
                    agent: agent.clone(),
                    name: line.to_string(),
                    pid: -1,
                    status: "error".to_string(),
                }),
                None => warn!(line, "Dropping error row for unknown host"),
            }
        }
    }

    ParsedStatus { rows, aggregate }
}

/// `'Name Possibly With Spaces' (1764) is running.` → (name, pid, status)
fn parse_process_line(line: &str) -> Option<(String, i64, String)> {
    let rest = line.strip_prefix('\'')?;
    let (name, rest) = rest.split_once('\'')?;
    let rest = rest.trim_start();

    let rest = rest.strip_prefix('(')?;
    let (pid_str, rest) = rest.split_once(')')?;
    let pid: i64 = pid_str.trim().parse().ok()?;

    let status = rest.trim().strip_prefix("is ")?;
    let status = status.strip_suffix('.').unwrap_or(status);
    Some((name.to_string(), pid, status.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_line_shapes() {
        assert_eq!(
            parse_process_line("'Server Repository Database' (1764) is running."),
            Some(("Server Repository Database".to_string(), 1764, "running".to_string()))
        );
        assert_eq!(
            parse_process_line("'Gateway' (88) is stopped."),
            Some(("Gateway".to_string(), 88, "stopped".to_string()))
        );
        assert_eq!(parse_process_line("'Gateway' (nan) is running."), None);
        assert_eq!(parse_process_line("Status: RUNNING"), None);
    }

    #[test]
    fn test_single_section_with_aggregate() {
        let out = "\
'Server Repository Database' (1764) is running.
'Server Gateway' (212) is running.
Status: RUNNING
";
        let parsed = parse_status_output(out, "primary-1", |_| None);
        assert_eq!(parsed.aggregate.as_deref(), Some("RUNNING"));
        assert_eq!(parsed.rows.len(), 3);
        assert!(parsed.rows.iter().all(|r| r.agent == "primary-1"));
        assert_eq!(parsed.rows[2].name, "Status");
        assert_eq!(parsed.rows[2].pid, 0);
    }

    #[test]
    fn test_degraded_overrides_aggregate() {
        let out = "\
Status: RUNNING
worker-1:
'Server Repository Database' (99) is stopped.
Status: DEGRADED
";
        let parsed = parse_status_output(out, "primary-1", |host| {
            (host == "worker-1").then(|| "worker-1".to_string())
        });
        assert_eq!(parsed.aggregate.as_deref(), Some("DEGRADED"));
        let worker_rows: Vec<_> = parsed
            .rows
            .iter()
            .filter(|r| r.agent == "worker-1")
            .collect();
        assert_eq!(worker_rows.len(), 2);
    }

    #[test]
    fn test_error_rows_get_pid_minus_one() {
        let out = "\
Connection error contacting worker 1
Status: DEGRADED
";
        let parsed = parse_status_output(out, "primary-1", |_| None);
        assert_eq!(parsed.rows[0].pid, -1);
        assert_eq!(parsed.rows[0].status, "error");
        assert_eq!(parsed.rows[0].name, "Connection error contacting worker 1");
    }

    #[test]
    fn test_unknown_host_section_dropped() {
        let out = "\
ghost-host:
'Server Gateway' (212) is running.
Status: RUNNING
";
        let parsed = parse_status_output(out, "primary-1", |_| None);
        // The row is dropped, but the aggregate still counts.
        assert!(parsed.rows.is_empty());
        assert_eq!(parsed.aggregate.as_deref(), Some("RUNNING"));
    }
}
