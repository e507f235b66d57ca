use serde::{Deserialize, Serialize};

use crate::error::OpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Structured result returned by every orchestration entry point.
///
/// Operations never raise past their boundary: failures are carried in
/// `error` with a best-effort `info` narrative alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpReport {
    pub status: OpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_location: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub copy_failed: bool,
}

impl OpReport {
    pub fn ok() -> Self {
        Self {
            status: OpStatus::Ok,
            error: None,
            info: None,
            size: None,
            destination_type: None,
            destination_name: None,
            destination_location: None,
            copy_failed: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let mut report = Self::ok();
        report.status = OpStatus::Failed;
        report.error = Some(error.into());
        report
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.append_info(info);
        self
    }

    /// Append a line to the `info` narrative.
    pub fn append_info(&mut self, line: impl Into<String>) {
        let line = line.into();
        if line.is_empty() {
            return;
        }
        match &mut self.info {
            Some(info) => {
                info.push('\n');
                info.push_str(&line);
            }
            None => self.info = Some(line),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OpStatus::Ok
    }
}

impl From<OpError> for OpReport {
    fn from(err: OpError) -> Self {
        OpReport::failed(err.to_string())
    }
}

/// Render a byte count the way the operator-facing narratives expect.
pub fn size_str(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;
    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Render a duration in seconds as H:MM:SS.
pub fn seconds_str(total: u64) -> String {
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serialization_omits_empty_fields() {
        let report = OpReport::ok();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "OK");
        assert!(json.get("error").is_none());
        assert!(json.get("copy_failed").is_none());
    }

    #[test]
    fn test_failed_report() {
        let report = OpReport::failed("no primary agent connected");
        assert!(!report.is_ok());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["error"], "no primary agent connected");
    }

    #[test]
    fn test_append_info() {
        let mut report = OpReport::ok();
        report.append_info("Backup size: 2.0 GB");
        report.append_info("Backup elapsed time: 0:10:00");
        assert_eq!(
            report.info.as_deref(),
            Some("Backup size: 2.0 GB\nBackup elapsed time: 0:10:00")
        );
    }

    #[test]
    fn test_size_str() {
        assert_eq!(size_str(512), "512 bytes");
        assert_eq!(size_str(2 * 1024 * 1024 * 1024), "2.0 GB");
    }

    #[test]
    fn test_seconds_str() {
        assert_eq!(seconds_str(3725), "1:02:05");
    }
}
