use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Address the agent handshake listener binds to.
    pub listen_addr: String,
    /// Domain this controller instance manages (one state machine per domain).
    pub domain: String,
    /// Directory for controller data (database, staging).
    pub data_dir: PathBuf,
    /// SQLite database path.
    pub db_path: PathBuf,

    /// Interval between status polls, in seconds.
    pub status_interval_secs: u64,
    /// Minimum dwell while DEGRADED before the degraded event is sent.
    pub degraded_dwell_secs: u64,
    /// Sleep between command polls.
    pub poll_interval_secs: u64,
    /// Wall-clock budget for status commands.
    pub status_timeout_secs: u64,
    /// Wall-clock budget for backup/restore/ziplogs commands.
    pub command_timeout_secs: u64,

    /// Fraction of the server's data size required free for backup/ziplogs.
    pub min_disk_ratio: f64,
    /// Subdirectory (under an agent data dir) for backup files.
    pub backup_dir: String,
    /// Subdirectory for ziplog archives.
    pub ziplog_dir: String,
    /// Staging subdirectory on the primary for inbound restore files.
    pub staging_dir: String,

    /// Retention counts for rotation.
    pub backup_auto_retain: usize,
    pub backup_user_retain: usize,
    pub ziplog_auto_retain: usize,
    pub ziplog_user_retain: usize,

    /// Maintenance page listen port pushed to gateway agents.
    pub maint_listen_port: u16,

    /// Cron expressions for scheduled jobs (empty disables the job).
    pub backup_cron: String,
    pub ziplogs_cron: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8888".to_string(),
            domain: "default".to_string(),
            data_dir: PathBuf::from("/var/lib/shepherd"),
            db_path: PathBuf::from("/var/lib/shepherd/shepherd.db"),
            status_interval_secs: 10,
            degraded_dwell_secs: 120,
            poll_interval_secs: 10,
            status_timeout_secs: 60 * 5,
            command_timeout_secs: 60 * 60 * 2,
            min_disk_ratio: 0.3,
            backup_dir: "server-backups".to_string(),
            ziplog_dir: "server-logs".to_string(),
            staging_dir: "staging".to_string(),
            backup_auto_retain: 5,
            backup_user_retain: 3,
            ziplog_auto_retain: 5,
            ziplog_user_retain: 3,
            maint_listen_port: 80,
            backup_cron: "0 0 * * *".to_string(),
            ziplogs_cron: String::new(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SHEP_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Ok(v) = std::env::var("SHEP_DOMAIN") {
            config.domain = v;
        }
        if let Ok(v) = std::env::var("SHEP_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHEP_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHEP_STATUS_INTERVAL") {
            if let Ok(secs) = v.parse() {
                config.status_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SHEP_DEGRADED_DWELL") {
            if let Ok(secs) = v.parse() {
                config.degraded_dwell_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SHEP_POLL_INTERVAL") {
            if let Ok(secs) = v.parse() {
                config.poll_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SHEP_STATUS_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                config.status_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SHEP_COMMAND_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                config.command_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SHEP_MIN_DISK_RATIO") {
            if let Ok(ratio) = v.parse() {
                config.min_disk_ratio = ratio;
            }
        }
        if let Ok(v) = std::env::var("SHEP_BACKUP_AUTO_RETAIN") {
            if let Ok(n) = v.parse() {
                config.backup_auto_retain = n;
            }
        }
        if let Ok(v) = std::env::var("SHEP_BACKUP_USER_RETAIN") {
            if let Ok(n) = v.parse() {
                config.backup_user_retain = n;
            }
        }
        if let Ok(v) = std::env::var("SHEP_ZIPLOG_AUTO_RETAIN") {
            if let Ok(n) = v.parse() {
                config.ziplog_auto_retain = n;
            }
        }
        if let Ok(v) = std::env::var("SHEP_ZIPLOG_USER_RETAIN") {
            if let Ok(n) = v.parse() {
                config.ziplog_user_retain = n;
            }
        }
        if let Ok(v) = std::env::var("SHEP_MAINT_PORT") {
            if let Ok(port) = v.parse() {
                config.maint_listen_port = port;
            }
        }
        if let Ok(v) = std::env::var("SHEP_BACKUP_CRON") {
            config.backup_cron = v;
        }
        if let Ok(v) = std::env::var("SHEP_ZIPLOGS_CRON") {
            config.ziplogs_cron = v;
        }

        config
    }

    /// Load the .env file (if present) and then the environment.
    pub fn load(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            load_dotenv(path);
        } else {
            let candidates = [PathBuf::from("/etc/shepherd/.env"), PathBuf::from(".env")];
            for candidate in &candidates {
                if candidate.exists() {
                    load_dotenv(candidate);
                    break;
                }
            }
        }

        Self::from_env()
    }
}

/// Load a basic .env file (KEY=VALUE per line).
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: called before spawning any threads (single-threaded init)
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.status_interval_secs, 10);
        assert_eq!(config.degraded_dwell_secs, 120);
        assert_eq!(config.status_timeout_secs, 300);
        assert_eq!(config.command_timeout_secs, 7200);
    }
}
