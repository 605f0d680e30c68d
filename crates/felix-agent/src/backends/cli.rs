use super::{excerpt, parse_usage};
use crate::catalog::ModelCatalog;
use crate::config::ModelConfig;
use crate::worker::{WorkOutcome, WorkRequest, Worker};
use async_trait::async_trait;
use felix_core::{Backend, FelixError, FelixResult, Provider, TokenUsage};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

/// Worker that drives a provider's coding CLI as a subprocess.
///
/// Runs `claude`, `codex` or `gemini` in headless mode with JSON output.
/// Uses the user's existing CLI login, so no API key is needed. Files are
/// edited by the CLI itself; changes are detected by diffing
/// `git status --porcelain` before and after the run.
pub struct CliWorker {
    config: ModelConfig,
    catalog: Arc<ModelCatalog>,
    executable: String,
}

impl CliWorker {
    pub fn new(config: ModelConfig, catalog: Arc<ModelCatalog>) -> Self {
        let executable = config.provider.executable().to_string();
        Self {
            config,
            catalog,
            executable,
        }
    }

    /// Run a different binary than the provider's default (wrappers, tests).
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Build the headless invocation for `request`.
    pub fn command(&self, request: &WorkRequest) -> Command {
        let mut cmd = Command::new(&self.executable);
        let model = if request.model.is_empty() {
            &self.config.model_id
        } else {
            &request.model
        };

        match self.config.provider {
            Provider::Anthropic => {
                cmd.arg("-p").arg(&request.prompt);
                cmd.arg("--output-format").arg("json");
                cmd.arg("--max-turns").arg(self.config.max_turns.to_string());
                if !model.is_empty() && model != "default" {
                    cmd.arg("--model").arg(model);
                }
                let mode = if request.dry_run { "plan" } else { "acceptEdits" };
                cmd.arg("--permission-mode").arg(mode);
                cmd.arg("--no-session-persistence");
            }
            Provider::OpenAi => {
                cmd.arg("exec").arg("--json");
                if !model.is_empty() {
                    cmd.arg("--model").arg(model);
                }
                let sandbox = if request.dry_run {
                    "read-only"
                } else {
                    "workspace-write"
                };
                cmd.arg("--sandbox").arg(sandbox);
                cmd.arg(&request.prompt);
            }
            Provider::Google => {
                cmd.arg("-p").arg(&request.prompt);
                cmd.arg("--output-format").arg("json");
                if !model.is_empty() {
                    cmd.arg("--model").arg(model);
                }
                if !request.dry_run {
                    cmd.arg("--yolo");
                }
            }
        }

        cmd.current_dir(&request.working_dir);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Worker for CliWorker {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    fn backend(&self) -> Backend {
        Backend::Cli
    }

    fn model(&self) -> &str {
        &self.config.model_id
    }

    async fn execute(&self, request: &WorkRequest) -> FelixResult<WorkOutcome> {
        if request.prompt.is_empty() {
            return Err(FelixError::Worker(format!(
                "empty prompt for task {}",
                request.task.id
            )));
        }

        let before = git_status(&request.working_dir).await;
        let mut cmd = self.command(request);

        tracing::info!(
            task_id = %request.task.id,
            provider = %self.config.provider,
            model = %request.model,
            dry_run = request.dry_run,
            prompt_len = request.prompt.len(),
            "Spawning worker CLI"
        );

        let output = match tokio::time::timeout(request.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                FelixError::Worker(format!(
                    "Failed to run '{}' CLI. Is it installed? Error: {e}",
                    self.executable
                ))
            })?,
            Err(_) => return Err(FelixError::Timeout(request.timeout.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(FelixError::Worker(format!(
                "{} CLI failed (exit {}): {}",
                self.executable,
                output.status.code().unwrap_or(-1),
                excerpt(stderr.trim(), 500)
            )));
        }

        let parsed = parse_cli_output(&stdout);
        let cost_usd = parsed
            .cost_usd
            .unwrap_or_else(|| self.catalog.cost(&request.model, parsed.tokens));

        tracing::info!(
            task_id = %request.task.id,
            cost_usd,
            input_tokens = parsed.tokens.input,
            output_tokens = parsed.tokens.output,
            is_error = parsed.is_error,
            "Worker CLI finished"
        );

        let mut outcome = if parsed.is_error {
            WorkOutcome::failed(parsed.text, parsed.tokens, cost_usd)
        } else {
            WorkOutcome::succeeded(parsed.text, parsed.tokens, cost_usd)
        };
        if !request.dry_run {
            let after = git_status(&request.working_dir).await;
            outcome.file_changes = changed_files(&before, &after);
        }
        Ok(outcome)
    }
}

/// The useful parts of a headless CLI run.
#[derive(Debug, Clone, PartialEq)]
pub struct CliOutput {
    pub text: String,
    pub is_error: bool,
    pub tokens: TokenUsage,
    /// Cost as reported by the CLI, when it reports one.
    pub cost_usd: Option<f64>,
}

/// Parse CLI stdout. The last line that is a JSON object carries the result;
/// output with no JSON at all is taken verbatim as a successful result.
pub fn parse_cli_output(stdout: &str) -> CliOutput {
    let json = stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .find(|v| v.is_object())
        .or_else(|| serde_json::from_str::<serde_json::Value>(stdout.trim()).ok());

    let Some(json) = json.filter(|v| v.is_object()) else {
        return CliOutput {
            text: stdout.trim().to_string(),
            is_error: false,
            tokens: TokenUsage::default(),
            cost_usd: None,
        };
    };

    let text = ["result", "response", "text", "message"]
        .iter()
        .find_map(|k| json[*k].as_str())
        .unwrap_or_default()
        .to_string();
    let is_error = json["is_error"].as_bool().unwrap_or(false)
        || json["error"].is_object()
        || json["error"].is_string();
    let text = if is_error && text.is_empty() {
        json["error"]["message"]
            .as_str()
            .or_else(|| json["error"].as_str())
            .unwrap_or("worker reported an error")
            .to_string()
    } else {
        text
    };
    let usage = if json["usage"].is_object() {
        &json["usage"]
    } else {
        &json["stats"]
    };

    CliOutput {
        text,
        is_error,
        tokens: parse_usage(usage),
        cost_usd: json["total_cost_usd"].as_f64(),
    }
}

/// `git status --porcelain` lines for `dir`; empty outside a repository.
async fn git_status(dir: &Path) -> Vec<String> {
    let output = Command::new("git")
        .arg("status")
        .arg("--porcelain")
        .current_dir(dir)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::debug!(error = %e, "git status unavailable, file changes not tracked");
            Vec::new()
        }
    }
}

/// Paths whose porcelain entry appeared or changed between two snapshots.
pub fn changed_files(before: &[String], after: &[String]) -> Vec<String> {
    let before: HashSet<&str> = before.iter().map(String::as_str).collect();
    let mut files: Vec<String> = after
        .iter()
        .filter(|line| !before.contains(line.as_str()))
        .filter_map(|line| line.get(3..))
        .map(|path| match path.split_once(" -> ") {
            Some((_, renamed)) => renamed.to_string(),
            None => path.to_string(),
        })
        .collect();
    files.sort();
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_core::Task;
    use std::time::Duration;

    fn request(dry_run: bool) -> WorkRequest {
        WorkRequest {
            task: Task::new("T1", "Do it"),
            prompt: "implement T1".into(),
            model: "claude-sonnet-4".into(),
            temperature: 0.2,
            timeout: Duration::from_secs(5),
            working_dir: std::env::temp_dir(),
            dry_run,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn worker(provider: Provider, model: &str) -> CliWorker {
        CliWorker::new(
            ModelConfig::new(provider, Backend::Cli, model),
            Arc::new(ModelCatalog::default()),
        )
    }

    #[test]
    fn test_claude_command_dry_run_uses_plan_mode() {
        let w = worker(Provider::Anthropic, "claude-sonnet-4");
        let a = args(&w.command(&request(true)));
        assert_eq!(a[0], "-p");
        assert!(a.windows(2).any(|p| p == ["--permission-mode", "plan"]));
        assert!(a.windows(2).any(|p| p == ["--model", "claude-sonnet-4"]));

        let live = args(&w.command(&request(false)));
        assert!(live.windows(2).any(|p| p == ["--permission-mode", "acceptEdits"]));
    }

    #[test]
    fn test_codex_command_sandbox() {
        let w = worker(Provider::OpenAi, "gpt-4.1");
        let mut req = request(true);
        req.model = "gpt-4.1".into();
        let a = args(&w.command(&req));
        assert_eq!(a[0], "exec");
        assert!(a.windows(2).any(|p| p == ["--sandbox", "read-only"]));
        assert_eq!(a.last().map(String::as_str), Some("implement T1"));
    }

    #[test]
    fn test_gemini_command_yolo_only_when_editing() {
        let w = worker(Provider::Google, "gemini-2.5-pro");
        assert!(!args(&w.command(&request(true))).contains(&"--yolo".to_string()));
        assert!(args(&w.command(&request(false))).contains(&"--yolo".to_string()));
    }

    #[test]
    fn test_parse_claude_json() {
        let stdout = r#"{"type":"result","is_error":false,"result":"done","total_cost_usd":0.42,"usage":{"input_tokens":1000,"output_tokens":200}}"#;
        let parsed = parse_cli_output(stdout);
        assert_eq!(parsed.text, "done");
        assert!(!parsed.is_error);
        assert_eq!(parsed.tokens, TokenUsage::new(1000, 200));
        assert_eq!(parsed.cost_usd, Some(0.42));
    }

    #[test]
    fn test_parse_takes_last_json_line() {
        let stdout = "progress...\n{\"result\":\"first\"}\n{\"result\":\"last\",\"is_error\":true}\n";
        let parsed = parse_cli_output(stdout);
        assert_eq!(parsed.text, "last");
        assert!(parsed.is_error);
    }

    #[test]
    fn test_parse_plain_text() {
        let parsed = parse_cli_output("all good\n");
        assert_eq!(parsed.text, "all good");
        assert!(!parsed.is_error);
        assert!(parsed.cost_usd.is_none());
    }

    #[test]
    fn test_parse_error_object() {
        let parsed = parse_cli_output(r#"{"error":{"message":"quota exhausted"}}"#);
        assert!(parsed.is_error);
        assert_eq!(parsed.text, "quota exhausted");
    }

    #[test]
    fn test_changed_files_diff() {
        let before = vec![" M src/lib.rs".to_string()];
        let after = vec![
            " M src/lib.rs".to_string(),
            "?? src/new.rs".to_string(),
            "R  old.rs -> renamed.rs".to_string(),
        ];
        assert_eq!(changed_files(&before, &after), vec!["renamed.rs", "src/new.rs"]);
    }

    #[tokio::test]
    async fn test_missing_executable_is_worker_error() {
        let w = worker(Provider::Anthropic, "claude-sonnet-4")
            .with_executable("felix-definitely-not-installed");
        let err = w.execute(&request(true)).await.unwrap_err();
        assert!(matches!(err, FelixError::Worker(_)));
    }
}
