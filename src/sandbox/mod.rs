//! Execution isolation for translator-generated statistics code.
//!
//! The primary backend re-invokes this binary's hidden `sandbox-worker`
//! subcommand: the child gets the program and CSV on stdin, runs the stats
//! DSL with hard in-evaluator budgets, and writes one JSON outcome to
//! stdout. The parent owns the wall clock: on timeout the child is killed,
//! and it is reaped on every exit path. Network and filesystem access are
//! impossible by construction: the DSL grammar has no I/O forms.
//!
//! When spawning is unavailable at startup the gateway degrades to an
//! in-process restricted evaluator; every such run is flagged loudly.

pub mod worker;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::metrics;

/// Serialized results larger than this are rejected outright.
pub const OUTPUT_CAP_BYTES: usize = 10 * 1024;
/// Row×op work budget for one evaluation.
pub const WORK_BUDGET: u64 = 5_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    /// Successful evaluation; the JSON value of the result.
    Ok(serde_json::Value),
    /// Code failed DSL validation; recoverable via reflection.
    Grammar(String),
    /// A cap was exceeded (time, work, output size).
    Unsafe(String),
    /// Data or infrastructure problem.
    Error(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub code: String,
    pub csv: String,
    pub budget: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok { value: serde_json::Value },
    Err { kind: String, message: String },
}

#[async_trait]
pub trait SandboxExec: Send + Sync {
    async fn run(&self, code: &str, csv: &str) -> SandboxOutcome;
    /// True for the degraded in-process evaluator.
    fn is_fallback(&self) -> bool {
        false
    }
}

pub struct ProcessSandbox {
    exe: PathBuf,
    timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(exe: PathBuf, timeout: Duration) -> Self {
        Self { exe, timeout }
    }
}

#[async_trait]
impl SandboxExec for ProcessSandbox {
    async fn run(&self, code: &str, csv: &str) -> SandboxOutcome {
        // Grammar gate before any process is spawned.
        if let Err(err) = qwed_engines::stats::parse_program(code) {
            return match err {
                qwed_engines::stats::StatsError::Grammar(msg) => SandboxOutcome::Grammar(msg),
                other => SandboxOutcome::Grammar(other.to_string()),
            };
        }

        let mut child = match Command::new(&self.exe)
            .arg("sandbox-worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return SandboxOutcome::Error(format!("sandbox spawn failed: {err}")),
        };

        let request = WorkerRequest {
            code: code.to_string(),
            csv: csv.to_string(),
            budget: WORK_BUDGET,
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(payload) => payload,
            Err(err) => return SandboxOutcome::Error(format!("request encode failed: {err}")),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(&payload).await.is_err() {
                // Child died before reading; fall through to reap it.
            }
            drop(stdin);
        }

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return SandboxOutcome::Error(format!("sandbox wait failed: {err}")),
            Err(_) => {
                // kill_on_drop reaps the child when `child` goes out of
                // scope inside wait_with_output's future.
                return SandboxOutcome::Unsafe(format!(
                    "execution exceeded {}s wall clock",
                    self.timeout.as_secs()
                ));
            }
        };

        if output.stdout.len() > OUTPUT_CAP_BYTES {
            return SandboxOutcome::Unsafe(format!(
                "output exceeded {OUTPUT_CAP_BYTES} byte cap"
            ));
        }

        match serde_json::from_slice::<WorkerResponse>(&output.stdout) {
            Ok(WorkerResponse::Ok { value }) => SandboxOutcome::Ok(value),
            Ok(WorkerResponse::Err { kind, message }) => match kind.as_str() {
                "grammar" => SandboxOutcome::Grammar(message),
                "budget" => SandboxOutcome::Unsafe(message),
                _ => SandboxOutcome::Error(message),
            },
            Err(err) => SandboxOutcome::Error(format!("sandbox produced no outcome: {err}")),
        }
    }
}

/// In-process fallback evaluator used only when process isolation is
/// unavailable. Flagged on every run.
pub struct RestrictedSandbox {
    timeout: Duration,
}

impl RestrictedSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SandboxExec for RestrictedSandbox {
    async fn run(&self, code: &str, csv: &str) -> SandboxOutcome {
        warn!("stats execution running on the restricted fallback evaluator");
        metrics::SANDBOX_FALLBACKS.inc();

        let code = code.to_string();
        let csv = csv.to_string();
        let work = tokio::task::spawn_blocking(move || {
            qwed_engines::stats::run(&code, &csv, WORK_BUDGET)
        });

        let outcome = match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                return SandboxOutcome::Error(format!("evaluator panicked: {join_err}"))
            }
            Err(_) => {
                return SandboxOutcome::Unsafe(format!(
                    "execution exceeded {}s wall clock",
                    self.timeout.as_secs()
                ))
            }
        };

        match outcome {
            Ok(value) => {
                let rendered = json!(value);
                if rendered.to_string().len() > OUTPUT_CAP_BYTES {
                    SandboxOutcome::Unsafe(format!("output exceeded {OUTPUT_CAP_BYTES} byte cap"))
                } else {
                    SandboxOutcome::Ok(rendered)
                }
            }
            Err(qwed_engines::stats::StatsError::Grammar(msg)) => SandboxOutcome::Grammar(msg),
            Err(qwed_engines::stats::StatsError::Budget) => {
                SandboxOutcome::Unsafe("work budget exhausted".into())
            }
            Err(other) => SandboxOutcome::Error(other.to_string()),
        }
    }

    fn is_fallback(&self) -> bool {
        true
    }
}

/// Pick the strongest isolation available at startup.
pub fn build_sandbox(timeout: Duration) -> Box<dyn SandboxExec> {
    match std::env::current_exe() {
        Ok(exe) if exe.file_name().map_or(false, |n| {
            n.to_string_lossy().starts_with("qwed-gateway")
        }) =>
        {
            info!(exe = %exe.display(), "process sandbox enabled");
            Box::new(ProcessSandbox::new(exe, timeout))
        }
        _ => {
            warn!("process isolation unavailable; falling back to restricted evaluator");
            Box::new(RestrictedSandbox::new(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "age,salary\n36,120000\n41,95000\n29,87000\n";

    #[tokio::test]
    async fn restricted_evaluator_runs_valid_code() {
        let sandbox = RestrictedSandbox::new(Duration::from_secs(5));
        let outcome = sandbox.run("df.mean(salary)", CSV).await;
        let SandboxOutcome::Ok(value) = outcome else {
            panic!("expected Ok, got {outcome:?}");
        };
        assert!((value.as_f64().unwrap() - 100_666.666).abs() < 1.0);
        assert!(sandbox.is_fallback());
    }

    #[tokio::test]
    async fn grammar_violations_never_execute() {
        let sandbox = RestrictedSandbox::new(Duration::from_secs(5));
        for code in ["import os", "df.mean(salary); open('/etc/passwd')", "exec('x')"] {
            let outcome = sandbox.run(code, CSV).await;
            assert!(
                matches!(outcome, SandboxOutcome::Grammar(_)),
                "{code} must be a grammar violation, got {outcome:?}"
            );
        }
    }

    #[tokio::test]
    async fn process_sandbox_grammar_gate_is_preflight() {
        // Even with a bogus executable, invalid code never spawns anything.
        let sandbox = ProcessSandbox::new(PathBuf::from("/nonexistent"), Duration::from_secs(1));
        let outcome = sandbox.run("import os", CSV).await;
        assert!(matches!(outcome, SandboxOutcome::Grammar(_)));
    }

    #[tokio::test]
    async fn unknown_column_is_an_error_not_unsafe() {
        let sandbox = RestrictedSandbox::new(Duration::from_secs(5));
        let outcome = sandbox.run("df.mean(bonus)", CSV).await;
        assert!(matches!(outcome, SandboxOutcome::Error(_)));
    }
}
