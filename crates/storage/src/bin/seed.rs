use std::fmt;

use chrono::{DateTime, Duration, Utc};
use exam_core::model::{
    ExamDefinition, ExamId, ExamQuestion, ExamStatus, Question, QuestionId, QuestionType,
};
use storage::repository::Storage;

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    exam_id: ExamId,
    title: String,
    duration_minutes: u32,
    pass_score: u32,
    retry_limit: u32,
    window_days: Option<u32>,
    now: Option<DateTime<Utc>>,
}

#[derive(Debug, PartialEq, Eq)]
enum ArgsError {
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

fn env_u32(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    flag: &'static str,
    default: u32,
) -> Result<u32, ArgsError> {
    env(key).map_or(Ok(default), |raw| parse_u32(flag, raw))
}

impl Args {
    fn parse(
        mut args: impl Iterator<Item = String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ArgsError> {
        let mut db_url = env("EXAM_DB_URL").unwrap_or_else(|| "sqlite:exam.sqlite3".into());
        let mut exam_id =
            ExamId::new(u64::from(env_u32(&env, "EXAM_SEED_EXAM_ID", "--exam-id", 1)?));
        let mut title = env("EXAM_SEED_TITLE").unwrap_or_else(|| "Workshop safety basics".into());
        let mut duration_minutes = env_u32(&env, "EXAM_SEED_DURATION", "--duration", 30)?;
        let mut pass_score = env_u32(&env, "EXAM_SEED_PASS_SCORE", "--pass-score", 60)?;
        let mut retry_limit = env_u32(&env, "EXAM_SEED_RETRY_LIMIT", "--retry-limit", 2)?;
        let mut window_days = None;
        let mut now: Option<DateTime<Utc>> = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--exam-id" => {
                    let value = require_value(&mut args, "--exam-id")?;
                    exam_id = ExamId::new(u64::from(parse_u32("--exam-id", value)?));
                }
                "--title" => {
                    title = require_value(&mut args, "--title")?;
                }
                "--duration" => {
                    let value = require_value(&mut args, "--duration")?;
                    duration_minutes = parse_u32("--duration", value)?;
                }
                "--pass-score" => {
                    let value = require_value(&mut args, "--pass-score")?;
                    pass_score = parse_u32("--pass-score", value)?;
                }
                "--retry-limit" => {
                    let value = require_value(&mut args, "--retry-limit")?;
                    retry_limit = parse_u32("--retry-limit", value)?;
                }
                "--window-days" => {
                    let value = require_value(&mut args, "--window-days")?;
                    window_days = Some(parse_u32("--window-days", value)?);
                }
                "--now" => {
                    let value = require_value(&mut args, "--now")?;
                    let parsed = DateTime::parse_from_rfc3339(&value)
                        .map_err(|_| ArgsError::InvalidNow { raw: value.clone() })?
                        .with_timezone(&Utc);
                    now = Some(parsed);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            exam_id,
            title,
            duration_minutes,
            pass_score,
            retry_limit,
            window_days,
            now,
        })
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:exam.sqlite3)");
    eprintln!("  --exam-id <id>            Exam id to upsert (default: 1)");
    eprintln!("  --title <text>            Exam title");
    eprintln!("  --duration <minutes>      Time limit per attempt (default: 30)");
    eprintln!("  --pass-score <n>          Passing score out of 100 (default: 60)");
    eprintln!("  --retry-limit <n>         Attempts allowed per user (default: 2)");
    eprintln!("  --window-days <n>         Close the exam n days after --now (default: open)");
    eprintln!("  --now <rfc3339>           Fixed current time for deterministic seeding");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!(
        "  EXAM_DB_URL, EXAM_SEED_EXAM_ID, EXAM_SEED_TITLE, EXAM_SEED_DURATION, \
         EXAM_SEED_PASS_SCORE, EXAM_SEED_RETRY_LIMIT"
    );
}

fn sample_bank() -> Result<Vec<(Question, u32)>, Box<dyn std::error::Error>> {
    let id = QuestionId::new;
    Ok(vec![
        (
            Question::new(
                id(1),
                QuestionType::SingleChoice,
                "Which extinguisher class is used on electrical fires?",
                "C",
            )?
            .with_options(vec!["A".into(), "B".into(), "C".into(), "D".into()])
            .with_category("fire")
            .with_difficulty(2)?,
            20,
        ),
        (
            Question::new(
                id(2),
                QuestionType::MultipleChoice,
                "Select all required protective equipment for grinding.",
                "A,C",
            )?
            .with_options(vec![
                "Safety glasses".into(),
                "Sandals".into(),
                "Gloves".into(),
                "Headphones".into(),
            ])
            .with_category("equipment")
            .with_difficulty(3)?,
            30,
        ),
        (
            Question::new(
                id(3),
                QuestionType::TrueFalse,
                "Guards may be removed while a machine is running.",
                "false",
            )?
            .with_category("equipment"),
            20,
        ),
        (
            Question::new(
                id(4),
                QuestionType::FillBlank,
                "The emergency stop button is coloured ____ on a ____ background.",
                "red|yellow",
            )?
            .with_explanation("Emergency stops are red on yellow.")
            .with_category("signage")
            .with_difficulty(2)?,
            20,
        ),
        (
            Question::new(
                id(5),
                QuestionType::Essay,
                "Describe how you would report a near miss.",
                "",
            )?
            .with_category("procedure")
            .with_difficulty(4)?,
            10,
        ),
    ])
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse(std::env::args().skip(1), |key| std::env::var(key).ok())
        .map_err(|e| {
            eprintln!("{e}");
            print_usage();
            e
        })?;

    let storage = Storage::sqlite(&args.db_url).await?;
    let now = args.now.unwrap_or_else(Utc::now);

    let bank = sample_bank()?;
    for (question, _) in &bank {
        storage.questions.upsert_question(question).await?;
    }

    let paper = bank
        .iter()
        .map(|(q, weight)| ExamQuestion::new(q.id(), *weight))
        .collect::<Vec<_>>();
    let total = paper.iter().map(|slot| slot.score).sum();
    let end_window = args
        .window_days
        .map(|days| now + Duration::days(i64::from(days)));
    let exam = ExamDefinition::new(
        args.exam_id,
        args.title.clone(),
        args.duration_minutes,
        total,
        args.pass_score,
        Some(now),
        end_window,
        args.retry_limit,
        ExamStatus::Published,
        paper,
    )?;
    storage.exams.upsert_exam(&exam).await?;

    println!(
        "Seeded exam {} ({} questions, pass {}/{}) into {}",
        exam.id(),
        exam.questions().len(),
        exam.pass_score(),
        exam.total_score(),
        args.db_url
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_args() -> impl Iterator<Item = String> {
        std::iter::empty()
    }

    #[test]
    fn environment_defaults_apply() {
        let args = Args::parse(no_args(), |_| None).unwrap();
        assert_eq!(args.exam_id, ExamId::new(1));
        assert_eq!(args.duration_minutes, 30);
        assert_eq!(args.retry_limit, 2);
    }

    #[test]
    fn malformed_environment_numbers_are_reported() {
        let env = |key: &str| (key == "EXAM_SEED_RETRY_LIMIT").then(|| "two".to_owned());
        let err = Args::parse(no_args(), env).unwrap_err();
        assert_eq!(
            err,
            ArgsError::InvalidNumber {
                flag: "--retry-limit",
                raw: "two".into()
            }
        );
    }

    #[test]
    fn flags_override_environment() {
        let env = |key: &str| (key == "EXAM_SEED_DURATION").then(|| "45".to_owned());
        let flags = ["--duration", "20"].map(str::to_owned).into_iter();
        let args = Args::parse(flags, env).unwrap();
        assert_eq!(args.duration_minutes, 20);
    }
}
