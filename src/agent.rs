//! In-process agent CLI invocations.
//!
//! Plan generation, conflict repair, test fixing, and experience reflection
//! all run the agent as a short-lived subprocess (not a container) and read
//! its stream-json stdout. The [`Agent`] trait exists so those flows can be
//! driven by a scripted [`MockAgent`] in tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::Config;
use crate::stream::{collect_text, LineParser, LogEvent};

#[derive(Debug)]
pub struct AgentRequest {
    /// Working directory for the call; the agent must not leave it.
    pub dir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    /// Optional live sink for parsed stream frames (plan streaming).
    pub events: Option<UnboundedSender<LogEvent>>,
}

impl AgentRequest {
    pub fn new(dir: impl Into<PathBuf>, prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            prompt: prompt.into(),
            timeout,
            events: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Concatenated assistant text of the stream.
    pub text: String,
    pub events: Vec<LogEvent>,
    pub success: bool,
    /// The call hit its deadline and was killed; `text` holds whatever had
    /// streamed by then.
    pub timed_out: bool,
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentRun>;
}

/// Spawns the real agent CLI:
/// `<cmd> -p "<prompt>" --dangerously-skip-permissions --output-format stream-json --verbose`
pub struct AgentCli {
    cmd: String,
    env: Vec<(String, String)>,
}

impl AgentCli {
    pub fn from_config(config: &Config) -> Self {
        let mut env = Vec::new();
        for (key, value) in [
            ("AGENT_API_KEY", &config.agent_api_key),
            ("AGENT_BASE_URL", &config.agent_base_url),
            ("AGENT_MODEL", &config.agent_model),
        ] {
            if let Some(value) = value {
                env.push((key.to_string(), value.clone()));
            }
        }
        Self {
            cmd: config.agent_cmd.clone(),
            env,
        }
    }
}

#[async_trait]
impl Agent for AgentCli {
    async fn run(&self, request: AgentRequest) -> Result<AgentRun> {
        let mut cmd = Command::new(&self.cmd);
        cmd.args([
            "-p",
            &request.prompt,
            "--dangerously-skip-permissions",
            "--output-format",
            "stream-json",
            "--verbose",
        ])
        .current_dir(&request.dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent process '{}'", self.cmd))?;
        let mut stdout = child
            .stdout
            .take()
            .context("agent process has no stdout")?;

        let deadline = tokio::time::Instant::now() + request.timeout;
        let mut parser = LineParser::new();
        let mut events: Vec<LogEvent> = Vec::new();
        let mut buf = [0u8; 8192];
        let mut timed_out = false;

        loop {
            let read = tokio::select! {
                read = stdout.read(&mut buf) => read,
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    let _ = child.kill().await;
                    break;
                }
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    for event in parser.feed(&buf[..n]) {
                        if let Some(sink) = &request.events {
                            let _ = sink.send(event.clone());
                        }
                        events.push(event);
                    }
                }
                Err(e) => {
                    eprintln!("[agent] stdout read error: {}", e);
                    break;
                }
            }
        }
        for event in parser.finish() {
            if let Some(sink) = &request.events {
                let _ = sink.send(event.clone());
            }
            events.push(event);
        }

        let success = if timed_out {
            false
        } else {
            match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
                Ok(Ok(status)) => status.success(),
                _ => {
                    let _ = child.kill().await;
                    false
                }
            }
        };

        Ok(AgentRun {
            text: collect_text(&events),
            events,
            success,
            timed_out,
        })
    }
}

// ── Test double ───────────────────────────────────────────────────────

type MockHandler = Box<dyn Fn(&AgentRequest) -> AgentRun + Send + Sync>;

/// Scripted agent: responses are consumed in call order; a handler closure
/// can inspect the request (and touch the filesystem, e.g. to "resolve" a
/// conflict). Records every prompt it saw.
#[derive(Default)]
pub struct MockAgent {
    script: std::sync::Mutex<std::collections::VecDeque<MockHandler>>,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.push_handler(move |_| AgentRun {
            text: text.clone(),
            events: Vec::new(),
            success: true,
            timed_out: false,
        });
    }

    pub fn push_timeout(&self) {
        self.push_handler(|_| AgentRun {
            text: String::new(),
            events: Vec::new(),
            success: false,
            timed_out: true,
        });
    }

    pub fn push_handler<F>(&self, handler: F)
    where
        F: Fn(&AgentRequest) -> AgentRun + Send + Sync + 'static,
    {
        self.script.lock().unwrap().push_back(Box::new(handler));
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentRun> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let handler = self.script.lock().unwrap().pop_front();
        let run = match handler {
            Some(handler) => handler(&request),
            None => AgentRun {
                text: String::new(),
                events: Vec::new(),
                success: true,
                timed_out: false,
            },
        };
        if let Some(sink) = &request.events {
            for event in &run.events {
                let _ = sink.send(event.clone());
            }
            if run.events.is_empty() && !run.text.is_empty() {
                let _ = sink.send(LogEvent::Assistant {
                    text: run.text.clone(),
                    timestamp: crate::models::now_iso(),
                });
            }
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_agent_scripted_responses() {
        let agent = MockAgent::new();
        agent.push_text("first answer");
        agent.push_text("second answer");

        let run = agent
            .run(AgentRequest::new("/tmp", "q1", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(run.text, "first answer");
        assert!(run.success);

        let run = agent
            .run(AgentRequest::new("/tmp", "q2", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(run.text, "second answer");
        assert_eq!(agent.prompt_count(), 2);
        assert_eq!(agent.prompts.lock().unwrap()[0], "q1");
    }

    #[tokio::test]
    async fn test_mock_agent_timeout_script() {
        let agent = MockAgent::new();
        agent.push_timeout();
        let run = agent
            .run(AgentRequest::new("/tmp", "slow", Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(run.timed_out);
        assert!(!run.success);
        assert!(run.text.is_empty());
    }

    #[tokio::test]
    async fn test_mock_agent_streams_text_to_sink() {
        let agent = MockAgent::new();
        agent.push_text("streamed");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut request = AgentRequest::new("/tmp", "q", Duration::from_secs(1));
        request.events = Some(tx);
        agent.run(request).await.unwrap();
        match rx.recv().await.unwrap() {
            LogEvent::Assistant { text, .. } => assert_eq!(text, "streamed"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_cli_reads_stream_json() {
        // Use a shell stand-in for the agent binary: it ignores its
        // arguments and prints two stream frames.
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-agent");
        tokio::fs::write(
            &fake,
            "#!/bin/sh\necho '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'\necho '{\"type\":\"result\",\"num_turns\":1}'\n",
        )
        .await
        .unwrap();
        let mut perms = std::fs::metadata(&fake).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&fake, perms).unwrap();

        let cli = AgentCli {
            cmd: fake.to_string_lossy().to_string(),
            env: Vec::new(),
        };
        let run = cli
            .run(AgentRequest::new(
                dir.path(),
                "prompt",
                Duration::from_secs(10),
            ))
            .await
            .unwrap();
        assert!(run.success);
        assert!(!run.timed_out);
        assert_eq!(run.text, "hi");
        assert_eq!(run.events.len(), 2);
    }

    #[tokio::test]
    async fn test_agent_cli_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("slow-agent");
        tokio::fs::write(&fake, "#!/bin/sh\nsleep 30\n").await.unwrap();
        let mut perms = std::fs::metadata(&fake).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&fake, perms).unwrap();

        let cli = AgentCli {
            cmd: fake.to_string_lossy().to_string(),
            env: Vec::new(),
        };
        let started = std::time::Instant::now();
        let run = cli
            .run(AgentRequest::new(
                dir.path(),
                "prompt",
                Duration::from_millis(200),
            ))
            .await
            .unwrap();
        assert!(run.timed_out);
        assert!(!run.success);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
