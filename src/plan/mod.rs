//! Plan mode: a pre-execution planning conversation with the agent, gated on
//! human approval.
//!
//! Generation and chat turns run the agent CLI in-process inside the repo
//! directory (never a container) and stream frames to the task's
//! `plan:<pid>:<tid>` topic while the text accumulates. The plan text, the
//! clarification questions, and the full message transcript are persisted on
//! the task; the worker prompt at claim time includes only the approved plan
//! text.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::agent::{Agent, AgentRequest};
use crate::config::Config;
use crate::events::{plan_topic, EventBus};
use crate::models::{PlanMessage, PlanQuestion, Task, TaskPatch, TaskStatus};
use crate::store::Store;

pub struct PlanService {
    store: Store,
    agent: Arc<dyn Agent>,
    events: Arc<EventBus>,
    config: Arc<Config>,
}

/// Per-task outcome of a batch approval call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Approved,
    Rejected,
    Skipped,
}

impl PlanService {
    pub fn new(
        store: Store,
        agent: Arc<dyn Agent>,
        events: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            agent,
            events,
            config,
        }
    }

    /// Generate (or regenerate) the plan for a task. Runs to completion;
    /// callers that want fire-and-forget spawn it. A timed-out call leaves
    /// the task in `plan_pending` with an empty plan for user retry.
    pub async fn generate(&self, project_id: &str, task_id: &str) -> Result<()> {
        let task = self.store.get_task(project_id, task_id).await?;
        self.store
            .update_task(project_id, task_id, TaskPatch::status(TaskStatus::PlanPending))
            .await?;
        self.events
            .emit("system", format!("Generating plan for: {}", task.title));

        let repo_dir = self.config.repo_dir(project_id);
        let prompt = plan_prompt(&task, &repo_dir);
        let run = self.run_streamed(project_id, task_id, &repo_dir, prompt).await?;

        if run.timed_out {
            self.events
                .emit("system", format!("Plan generation timed out for: {}", task.title));
            self.store
                .update_task(
                    project_id,
                    task_id,
                    TaskPatch {
                        status: Some(TaskStatus::PlanPending),
                        plan: Some(Some(String::new())),
                        error: Some(Some(format!(
                            "plan generation timed out ({}s)",
                            self.config.plan_timeout.as_secs()
                        ))),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        if !run.success {
            self.events
                .emit("system", format!("Plan generation failed for: {}", task.title));
            self.store
                .update_task(
                    project_id,
                    task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Failed),
                        error: Some(Some("plan generation failed".to_string())),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let questions = parse_questions(&run.text);
        let transcript = vec![PlanMessage::assistant(run.text.clone())];
        self.store
            .update_task(
                project_id,
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::PlanPending),
                    plan: Some(Some(run.text)),
                    plan_questions: Some(questions),
                    plan_messages: Some(Some(transcript)),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.events
            .emit("system", format!("Plan ready for: {}", task.title));
        Ok(())
    }

    /// Approve or reject a pending plan. Approval folds the chosen answers
    /// into the plan text; rejection prepends the feedback to the task
    /// description and sends the task back to `pending`.
    pub async fn approve(
        &self,
        project_id: &str,
        task_id: &str,
        approved: bool,
        answers: Option<serde_json::Map<String, serde_json::Value>>,
        feedback: Option<String>,
    ) -> Result<Task> {
        let task = self.store.get_task(project_id, task_id).await?;

        if approved {
            let mut plan_text = task.plan.clone().unwrap_or_default();
            if let Some(answers) = &answers
                && !answers.is_empty()
            {
                plan_text.push_str("\n\n---\n## User Answers\n");
                for (key, value) in answers {
                    let rendered = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    plan_text.push_str(&format!("- **{}**: {}\n", key, rendered));
                }
            }
            let updated = self
                .store
                .update_task(
                    project_id,
                    task_id,
                    TaskPatch {
                        status: Some(TaskStatus::PlanApproved),
                        plan: Some(Some(plan_text)),
                        plan_approved: Some(true),
                        plan_answers: Some(answers),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(updated)
        } else {
            let mut description = task.description.clone();
            if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
                description = format!("[Plan feedback] {}\n\n{}", feedback.trim(), description);
            }
            let updated = self
                .store
                .update_task(
                    project_id,
                    task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Pending),
                        description: Some(description),
                        plan_approved: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(updated)
        }
    }

    /// Approve or reject a list of plans independently; per-task outcomes
    /// are reported so one bad id cannot fail the batch.
    pub async fn batch_approve(
        &self,
        project_id: &str,
        task_ids: &[String],
        approved: bool,
        feedback: Option<String>,
    ) -> Vec<(String, BatchOutcome)> {
        let mut results = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let eligible = matches!(
                self.store.get_task(project_id, task_id).await,
                Ok(task) if task.status == TaskStatus::PlanPending
            );
            if !eligible {
                results.push((task_id.clone(), BatchOutcome::Skipped));
                continue;
            }
            let outcome = match self
                .approve(project_id, task_id, approved, None, feedback.clone())
                .await
            {
                Ok(_) if approved => BatchOutcome::Approved,
                Ok(_) => BatchOutcome::Rejected,
                Err(_) => BatchOutcome::Skipped,
            };
            results.push((task_id.clone(), outcome));
        }
        results
    }

    /// One conversational refinement turn: record the user message, run the
    /// agent with the transcript as context, record and stream the reply.
    pub async fn chat(&self, project_id: &str, task_id: &str, message: &str) -> Result<()> {
        let task = self.store.get_task(project_id, task_id).await?;
        let mut transcript = task.plan_messages.clone().unwrap_or_default();
        transcript.push(PlanMessage::user(message));

        // Persist the user turn immediately so the UI sees it while the
        // agent thinks.
        self.store
            .update_task(
                project_id,
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::PlanPending),
                    plan_messages: Some(Some(transcript.clone())),
                    ..Default::default()
                },
            )
            .await?;

        let repo_dir = self.config.repo_dir(project_id);
        let prompt = chat_prompt(&task, &transcript, &repo_dir);
        let run = self.run_streamed(project_id, task_id, &repo_dir, prompt).await?;

        let reply = if run.timed_out {
            format!(
                "Error: plan chat timed out ({}s)",
                self.config.plan_timeout.as_secs()
            )
        } else if !run.success {
            "Error: plan chat failed".to_string()
        } else {
            run.text.clone()
        };
        transcript.push(PlanMessage::assistant(reply.clone()));

        let plan_patch = if run.success && !run.timed_out {
            Some(Some(reply))
        } else {
            None
        };
        self.store
            .update_task(
                project_id,
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::PlanPending),
                    plan: plan_patch,
                    plan_messages: Some(Some(transcript)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Run the agent with frames forwarded to the plan topic.
    async fn run_streamed(
        &self,
        project_id: &str,
        task_id: &str,
        repo_dir: &Path,
        prompt: String,
    ) -> Result<crate::agent::AgentRun> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let topic = plan_topic(project_id, task_id);
        let events = Arc::clone(&self.events);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(value) = serde_json::to_value(&event) {
                    events.publish(&topic, value);
                }
            }
        });

        let mut request = AgentRequest::new(repo_dir, prompt, self.config.plan_timeout);
        request.events = Some(tx);
        let run = self.agent.run(request).await;
        let _ = forwarder.await;

        // Close the stream visibly for subscribers.
        self.events.publish(
            &plan_topic(project_id, task_id),
            json!({"type": "plan_turn_done"}),
        );
        run
    }
}

fn plan_prompt(task: &Task, repo_dir: &Path) -> String {
    format!(
        "You are a senior software architect. Analyze the following task and produce a \
         detailed implementation plan.\n\n\
         ## Context\n\
         Your working directory is: {dir}\n\
         Only analyze and reference files inside {dir}. Do not read or mention anything \
         outside it.\n\n\
         ## Task: {title}\n\
         Description: {description}\n\n\
         ## Requirements\n\
         1. Explore the project structure first to understand how the codebase is organized.\n\
         2. List the files that need to be modified or created.\n\
         3. Give a step-by-step plan with the concrete change for each file.\n\
         4. Where a decision needs user input, ask a multiple-choice clarification question \
         with a sensible default.\n\
         5. Format the response as markdown. After the plan, emit the questions as a fenced \
         ```json code block: an array of objects with keys \"key\", \"question\", \
         \"options\", and \"default\". Emit an empty array if nothing needs clarification.\n\
         6. All file paths must be relative to {dir}.",
        dir = repo_dir.display(),
        title = task.title,
        description = task.description
    )
}

fn chat_prompt(task: &Task, transcript: &[PlanMessage], repo_dir: &Path) -> String {
    let mut conversation = String::new();
    for message in transcript {
        conversation.push_str(&format!("[{}]\n{}\n\n", message.role, message.content));
    }
    format!(
        "[Working directory: {dir} — only analyze files inside it]\n\n\
         You are refining an implementation plan for the task \"{title}\" in an ongoing \
         conversation. The conversation so far:\n\n{conversation}\
         Reply to the latest user message, updating the plan where needed.",
        dir = repo_dir.display(),
        title = task.title,
        conversation = conversation
    )
}

/// Pull the clarification questions out of the plan's fenced JSON block.
/// Lenient: a missing or malformed block simply yields no questions.
fn parse_questions(plan_text: &str) -> Option<Vec<PlanQuestion>> {
    let mut search_from = 0;
    while let Some(rel) = plan_text[search_from..].find("```json") {
        let start = search_from + rel + "```json".len();
        let Some(end_rel) = plan_text[start..].find("```") else {
            break;
        };
        let block = plan_text[start..start + end_rel].trim();
        if let Ok(questions) = serde_json::from_str::<Vec<PlanQuestion>>(block)
            && !questions.is_empty()
        {
            return Some(questions);
        }
        search_from = start + end_rel + 3;
    }
    None
}
