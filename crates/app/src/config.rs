use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use exam_core::grading::GradingPolicy;

pub const DEFAULT_DB_URL: &str = "sqlite:exam.sqlite3";
pub const DEFAULT_SWEEP_LIMIT: u32 = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidNumber { flag: &'static str, raw: String },
    InvalidNow { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidNumber { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidNow { raw } => {
                write!(f, "invalid --now value (expected RFC3339): {raw}")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

/// Settings for the expiry sweeper, from the environment overridden by flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    pub db_url: String,
    pub limit: u32,
    pub cheat_signal_threshold: u32,
    pub grace_secs: u32,
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Invocation {
    Run(SweeperConfig),
    Help,
}

impl SweeperConfig {
    #[must_use]
    pub fn policy(&self) -> GradingPolicy {
        GradingPolicy::new(self.cheat_signal_threshold, self.grace_secs)
    }

    /// Read `EXAM_*` variables (after loading `.env`), then apply CLI flags.
    ///
    /// # Errors
    ///
    /// Returns `ArgsError` for unknown flags or malformed values.
    pub fn load() -> Result<Invocation, ArgsError> {
        dotenvy::dotenv().ok();
        Self::parse(std::env::args().skip(1), |key| std::env::var(key).ok())
    }

    /// # Errors
    ///
    /// Returns `ArgsError` for unknown flags or malformed values.
    pub fn parse(
        mut args: impl Iterator<Item = String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Invocation, ArgsError> {
        let mut config = Self {
            db_url: env("EXAM_DB_URL").unwrap_or_else(|| DEFAULT_DB_URL.into()),
            limit: env_number(&env, "EXAM_SWEEP_LIMIT", "--limit")?
                .unwrap_or(DEFAULT_SWEEP_LIMIT),
            cheat_signal_threshold: env_number(&env, "EXAM_CHEAT_THRESHOLD", "--cheat-threshold")?
                .unwrap_or(GradingPolicy::DEFAULT_CHEAT_SIGNAL_THRESHOLD),
            grace_secs: env_number(&env, "EXAM_LATE_GRACE_SECS", "--grace-secs")?.unwrap_or(0),
            now: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    config.db_url = value;
                }
                "--limit" => {
                    config.limit = parse_u32("--limit", require_value(&mut args, "--limit")?)?;
                }
                "--cheat-threshold" => {
                    let value = require_value(&mut args, "--cheat-threshold")?;
                    config.cheat_signal_threshold = parse_u32("--cheat-threshold", value)?;
                }
                "--grace-secs" => {
                    let value = require_value(&mut args, "--grace-secs")?;
                    config.grace_secs = parse_u32("--grace-secs", value)?;
                }
                "--now" => {
                    let value = require_value(&mut args, "--now")?;
                    let parsed = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| ArgsError::InvalidNow { raw: value.clone() })?
                        .with_timezone(&Utc);
                    config.now = Some(parsed);
                }
                "--help" | "-h" => return Ok(Invocation::Help),
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        config.db_url = normalize_sqlite_url(&config.db_url);
        Ok(Invocation::Run(config))
    }
}

pub fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app --bin exam-sweeper -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: {DEFAULT_DB_URL})");
    eprintln!("  --limit <n>               Attempts expired per pass (default: {DEFAULT_SWEEP_LIMIT})");
    eprintln!("  --cheat-threshold <n>     Cheat signals tolerated before flagging (default: 3)");
    eprintln!("  --grace-secs <n>          Late-submission grace period (default: 0)");
    eprintln!("  --now <rfc3339>           Fixed current time for a deterministic pass");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags, also read from .env):");
    eprintln!(
        "  EXAM_DB_URL, EXAM_SWEEP_LIMIT, EXAM_CHEAT_THRESHOLD, EXAM_LATE_GRACE_SECS, RUST_LOG"
    );
}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_u32(flag: &'static str, value: String) -> Result<u32, ArgsError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ArgsError::InvalidNumber { flag, raw: value })
}

fn env_number(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    flag: &'static str,
) -> Result<Option<u32>, ArgsError> {
    env(key).map(|raw| parse_u32(flag, raw)).transpose()
}

/// Turn relative file URLs into absolute `sqlite://` URLs; in-memory URLs pass through.
#[must_use]
pub fn normalize_sqlite_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("sqlite::memory:")
        || trimmed.starts_with("sqlite://")
        || trimmed.contains("mode=memory")
    {
        return trimmed.to_owned();
    }

    let path_str = trimmed.strip_prefix("sqlite:").unwrap_or(trimmed);
    let path = Path::new(path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

/// Create the database file (and its directory) so the pool can open it.
///
/// # Errors
///
/// Returns an I/O error if the directory or file cannot be created.
pub fn prepare_sqlite_file(db_url: &str) -> std::io::Result<()> {
    let Some(path) = db_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Ok(());
    }

    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>().into_iter()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn run(invocation: Invocation) -> SweeperConfig {
        match invocation {
            Invocation::Run(config) => config,
            Invocation::Help => panic!("expected a run configuration"),
        }
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let config = run(SweeperConfig::parse(args(&["--db", "sqlite::memory:"]), no_env).unwrap());
        assert_eq!(config.db_url, "sqlite::memory:");
        assert_eq!(config.limit, DEFAULT_SWEEP_LIMIT);
        assert_eq!(config.now, None);
        assert_eq!(config.policy(), GradingPolicy::default());
    }

    #[test]
    fn flags_override_environment() {
        let env = |key: &str| match key {
            "EXAM_SWEEP_LIMIT" => Some("5".to_owned()),
            "EXAM_CHEAT_THRESHOLD" => Some("1".to_owned()),
            _ => None,
        };
        let config = run(SweeperConfig::parse(
            args(&["--db", "sqlite::memory:", "--limit", "20", "--grace-secs", "30"]),
            env,
        )
        .unwrap());
        assert_eq!(config.limit, 20);
        assert_eq!(config.cheat_signal_threshold, 1);
        assert_eq!(config.policy(), GradingPolicy::new(1, 30));
    }

    #[test]
    fn malformed_values_are_reported() {
        assert_eq!(
            SweeperConfig::parse(args(&["--limit", "many"]), no_env).unwrap_err(),
            ArgsError::InvalidNumber {
                flag: "--limit",
                raw: "many".into()
            }
        );
        assert_eq!(
            SweeperConfig::parse(args(&["--now"]), no_env).unwrap_err(),
            ArgsError::MissingValue { flag: "--now" }
        );
        assert!(matches!(
            SweeperConfig::parse(args(&["--bogus"]), no_env),
            Err(ArgsError::UnknownArg(_))
        ));
        assert_eq!(
            SweeperConfig::parse(args(&["-h"]), no_env).unwrap(),
            Invocation::Help
        );
    }

    #[test]
    fn relative_urls_become_absolute() {
        let url = normalize_sqlite_url("sqlite:data/exam.sqlite3");
        assert!(url.starts_with("sqlite:///"));
        assert!(url.ends_with("data/exam.sqlite3"));
        assert_eq!(
            normalize_sqlite_url("sqlite:file:x?mode=memory&cache=shared"),
            "sqlite:file:x?mode=memory&cache=shared"
        );
    }
}
