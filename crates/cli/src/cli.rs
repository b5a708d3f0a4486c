//! Command-line arguments.

use std::time::Duration;

use clap::{Parser, Subcommand};

use jobqueue_core::JobId;

fn parse_payload(s: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(s).map_err(|e| format!("payload is not valid JSON: {e}"))
}

fn parse_millis(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| format!("expected milliseconds: {e}"))
}

/// Operate a Postgres-backed job queue.
#[derive(Parser, Debug)]
#[command(name = "jobqueue", version)]
pub struct Cli {
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Overrides `JOBQUEUE_QUEUE_NAME`.
    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long, default_value_t = 5)]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Create the jobs table and indexes if missing.
    Migrate,
    /// Print per-status job counts.
    Stats,
    /// Delete terminal jobs older than the retention window.
    Reap,
    /// Enqueue one job.
    Enqueue {
        job_type: String,
        #[arg(long, value_parser = parse_payload, default_value = "{}")]
        payload: serde_json::Value,
        /// Delay before the job becomes claimable.
        #[arg(long = "delay-ms", value_parser = parse_millis)]
        delay: Option<Duration>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Print one job as JSON.
    Show { id: JobId },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let argv = ["jobqueue", "--database-url", "postgres://localhost/jobs"]
            .into_iter()
            .chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn parses_enqueue_with_options() {
        let cli = parse(&[
            "enqueue",
            "send-email",
            "--payload",
            r#"{"to":"a@b.com"}"#,
            "--delay-ms",
            "1500",
            "--priority",
            "1",
        ]);
        assert_eq!(
            cli.command,
            Command::Enqueue {
                job_type: "send-email".to_string(),
                payload: serde_json::json!({ "to": "a@b.com" }),
                delay: Some(Duration::from_millis(1500)),
                priority: Some(1),
                max_retries: None,
            }
        );
    }

    #[test]
    fn payload_defaults_to_empty_object() {
        let cli = parse(&["enqueue", "noop"]);
        assert!(matches!(cli.command, Command::Enqueue { payload, .. } if payload == serde_json::json!({})));
    }

    #[test]
    fn rejects_malformed_payload() {
        let result = Cli::try_parse_from([
            "jobqueue",
            "--database-url",
            "postgres://localhost/jobs",
            "enqueue",
            "noop",
            "--payload",
            "{not json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_show_id() {
        let id = JobId::new();
        let cli = parse(&["--queue", "reports", "show", &id.to_string()]);
        assert_eq!(cli.queue.as_deref(), Some("reports"));
        assert_eq!(cli.command, Command::Show { id });
    }
}
