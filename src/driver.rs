//! Per-conversation state machine (spec.md §4.3). Grounded on
//! `crates/session-manager/src/container.rs`'s `start`/`cold_start`
//! sequencing (check registry → acquire resource → run → record) and the
//! root `main.rs` reconnect-on-restart flow, re-targeted from session/
//! container lifecycle to the conversation lifecycle this core drives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::container::{self, BuildParams, ContainerExecutor};
use crate::errors::ContainerError;
use crate::log_sink::BatchLogSink;
use crate::models::{
    ConversationContext, ConversationId, ConversationStatus, Credential, DevEnvironment,
    ExecutionLogMetadata, TaskStatus,
};
use crate::registry::ExecutionRegistry;
use crate::repositories::{
    ConversationRepository, CredentialDecryptor, ExecutionLogRepository, PendingConversation,
    ResultRepository, SystemConfig, TaskRepository,
};
use crate::result_parser::ResultParser;
use crate::state::StateManager;
use crate::workspace::WorkspaceManager;

/// Outcome of the `running` phases, before the terminal-status write.
enum Outcome {
    Success { commit_hash: Option<String> },
    Failed { message: String },
    Cancelled,
}

pub struct ConversationDriver<C, T, L, R, D, S, K> {
    conversations: Arc<C>,
    tasks: Arc<T>,
    logs: Arc<L>,
    results: Arc<R>,
    decryptor: Arc<D>,
    config: Arc<S>,
    clock: Arc<K>,
    workspace: Arc<WorkspaceManager<S>>,
    container: Arc<ContainerExecutor<S>>,
    registry: Arc<ExecutionRegistry>,
}

/// Releases the conversation from the registry on every exit path,
/// including early returns — the registry has no implicit-cleanup
/// primitive of its own, so every driver attempt owns one of these.
struct ReleaseGuard<'a> {
    registry: &'a ExecutionRegistry,
    id: ConversationId,
    armed: bool,
}

impl<'a> ReleaseGuard<'a> {
    fn new(registry: &'a ExecutionRegistry, id: ConversationId) -> Self {
        Self { registry, id, armed: true }
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release(self.id);
        }
    }
}

impl<C, T, L, R, D, S, K> ConversationDriver<C, T, L, R, D, S, K>
where
    C: ConversationRepository,
    T: TaskRepository,
    L: ExecutionLogRepository + 'static,
    R: ResultRepository,
    D: CredentialDecryptor,
    S: SystemConfig,
    K: Clock,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<C>,
        tasks: Arc<T>,
        logs: Arc<L>,
        results: Arc<R>,
        decryptor: Arc<D>,
        config: Arc<S>,
        clock: Arc<K>,
        workspace: Arc<WorkspaceManager<S>>,
        container: Arc<ContainerExecutor<S>>,
        registry: Arc<ExecutionRegistry>,
    ) -> Self {
        Self {
            conversations,
            tasks,
            logs,
            results,
            decryptor,
            config,
            clock,
            workspace,
            container,
            registry,
        }
    }

    fn state(&self) -> StateManager<C, L> {
        StateManager::new(self.conversations.clone(), self.logs.clone())
    }

    /// Runs one attempt for `pending` to a terminal state. Never
    /// propagates an attempt-level failure — every error path ends in a
    /// persisted terminal status. Only returns `Err` for admission
    /// rejection, which leaves the conversation `pending`.
    pub async fn run(&self, pending: PendingConversation) -> Result<()> {
        let conv = pending.conversation;

        // Phase 1: validate.
        let (task, project, dev_environment) = match (pending.task, pending.project, pending.dev_environment) {
            (Some(t), Some(p), Some(d)) => (t, p, d),
            _ => {
                self.state()
                    .set_failed(conv.id, "task, project, or dev_environment missing")
                    .await
                    .context("persisting invariant-violation failure")?;
                return Ok(());
            }
        };

        // Phase 2: task status promotion (best-effort).
        if task.status == TaskStatus::Todo {
            if let Err(e) = self.tasks.update_status(task.id, TaskStatus::InProgress).await {
                tracing::warn!(task_id = task.id, error = %e, "failed to promote task to in_progress");
            }
        }

        // Phase 3: begin attempt.
        self.conversations
            .update_status(conv.id, ConversationStatus::Running)
            .await?;
        let log_id = self.logs.create(conv.id).await?;

        let cancel = CancellationToken::new();
        if !self.registry.admit(conv.id, cancel.clone()) {
            self.conversations
                .update_status(conv.id, ConversationStatus::Pending)
                .await?;
            return Err(anyhow!("admission rejected for conversation {}", conv.id));
        }
        let _release = ReleaseGuard::new(&self.registry, conv.id);

        let ctx = ConversationContext {
            conversation: conv,
            task,
            project,
            dev_environment,
        };

        let (outcome, rel) = self.drive(&ctx, log_id, cancel).await;

        self.finalize(&ctx, log_id, outcome, rel).await;
        Ok(())
    }

    /// Runs phases 5-12. Returns the outcome alongside the workspace's
    /// relative path whenever one was acquired — `finalize` needs it for
    /// post-failure cleanup even though `ctx.task.workspace_path` may
    /// still reflect the pre-attempt (empty) value.
    async fn drive(
        &self,
        ctx: &ConversationContext,
        log_id: i64,
        cancel: CancellationToken,
    ) -> (Outcome, Option<String>) {
        if cancel.is_cancelled() {
            return (Outcome::Cancelled, None);
        }

        // Phase 5: workspace acquire.
        let rel = match self
            .workspace
            .get_or_create(ctx.task.id, &ctx.task.workspace_path)
            .await
        {
            Ok(rel) => rel,
            Err(e) => {
                return (Outcome::Failed { message: format!("workspace acquire failed: {e}") }, None);
            }
        };
        if ctx.task.workspace_path.is_empty() {
            if let Err(e) = self.tasks.update_fields(ctx.task.id, Some(&rel), None, None).await {
                tracing::warn!(task_id = ctx.task.id, error = %e, "failed to persist workspace_path");
            }
        }

        let outcome = self.drive_in_workspace(ctx, log_id, &cancel, &rel).await;
        (outcome, Some(rel))
    }

    /// Phases 6-12, run against an already-acquired workspace.
    async fn drive_in_workspace(
        &self,
        ctx: &ConversationContext,
        log_id: i64,
        cancel: &CancellationToken,
        rel: &str,
    ) -> Outcome {
        macro_rules! checkpoint {
            () => {
                if cancel.is_cancelled() {
                    return Outcome::Cancelled;
                }
            };
        }

        // Phase 6: started_at.
        if let Err(e) = self
            .logs
            .update_metadata(
                log_id,
                ExecutionLogMetadata {
                    started_at: Some(Some(self.clock.now_utc())),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(error = %e, "failed to stamp started_at");
        }

        checkpoint!();

        // Phase 7: clone or reuse.
        let abs = self.workspace.abs(rel);
        if !abs.join(".git").is_dir() {
            let credential = match self.decrypt_credential(ctx.project.credential.as_ref()).await {
                Ok(c) => c,
                Err(e) => return Outcome::Failed { message: format!("clone repository failed: {e}") },
            };
            if let Err(e) = self
                .workspace
                .clone(
                    rel,
                    &ctx.project.repo_url,
                    &ctx.task.start_branch,
                    credential.as_ref(),
                    self.config.git_ssl_verify(),
                    &self.config.proxy(),
                )
                .await
            {
                return Outcome::Failed { message: format!("clone repository failed: {e}") };
            }
        }

        checkpoint!();

        // Phase 8: work branch.
        let work_branch = if ctx.task.work_branch.is_empty() {
            let branch = synthesize_work_branch(&ctx.task.created_by, &ctx.task.title, self.clock.now_utc());
            if let Err(e) = self.tasks.update_fields(ctx.task.id, None, Some(&branch), None).await {
                tracing::warn!(task_id = ctx.task.id, error = %e, "failed to persist work_branch");
            }
            branch
        } else {
            ctx.task.work_branch.clone()
        };
        if let Err(e) = self
            .workspace
            .checkout_branch(rel, &work_branch, &ctx.task.start_branch)
            .await
        {
            return Outcome::Failed { message: format!("checkout failed: {e}") };
        }

        checkpoint!();

        // Phase 9: build container command.
        let name = container::container_name(ctx.task.id, ctx.conversation.id);
        let session_dir_abs = self.session_dir_abs(&ctx.dev_environment);
        let params = BuildParams {
            task_id: ctx.task.id,
            conversation_id: ctx.conversation.id,
            content: &ctx.conversation.content,
            model: ctx.conversation.model(),
            is_plan_mode: ctx.conversation.is_plan_mode(),
            session_id: ctx.task.session_id.as_deref(),
            project_system_prompt: ctx.project.system_prompt.as_deref(),
            workspace_rel: rel,
            workspace_abs: &abs,
            session_dir_abs: session_dir_abs.as_deref(),
            container_name: Some(&name),
            with_stdin: true,
        };
        let built = self.container.build(&ctx.dev_environment, &params);

        // Phase 10: persist sanitized command.
        if let Err(e) = self
            .logs
            .update_metadata(
                log_id,
                ExecutionLogMetadata {
                    docker_command: Some(Some(built.sanitized)),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(error = %e, "failed to persist sanitized docker command");
        }

        checkpoint!();

        // Phase 11: execute.
        let sink = BatchLogSink::new(
            self.logs.clone(),
            log_id,
            self.config_log_batch_size(),
            self.config_log_flush_interval(),
        );
        let run_result = self.container.run(&built.exec, &sink, cancel.clone()).await;
        sink.close().await;

        match run_result {
            Ok(()) => {}
            Err(ContainerError::Cancelled) => {
                self.container.cancel_container(&name).await;
                return Outcome::Cancelled;
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    self.container.cancel_container(&name).await;
                    return Outcome::Cancelled;
                }
                return Outcome::Failed { message: e.to_string() };
            }
        }

        // Phase 12: commit.
        match self
            .workspace
            .commit(rel, &format!("AI generated changes for conversation {}", ctx.conversation.id))
            .await
        {
            Ok(hash) => {
                if let Err(e) = self.conversations.update_commit_hash(ctx.conversation.id, &hash).await {
                    tracing::warn!(error = %e, "failed to persist commit hash");
                }
                Outcome::Success { commit_hash: Some(hash) }
            }
            Err(crate::errors::WorkspaceError::NoChanges) => Outcome::Success { commit_hash: None },
            Err(e) => Outcome::Failed { message: format!("commit failed: {e}") },
        }
    }

    async fn finalize(&self, ctx: &ConversationContext, log_id: i64, outcome: Outcome, rel: Option<String>) {
        let (status, error_message) = match &outcome {
            Outcome::Success { commit_hash } => {
                tracing::info!(
                    conversation_id = ctx.conversation.id,
                    commit_hash = commit_hash.as_deref().unwrap_or("(no changes)"),
                    "conversation completed"
                );
                (ConversationStatus::Success, None)
            }
            Outcome::Failed { message } => (ConversationStatus::Failed, Some(message.clone())),
            Outcome::Cancelled => (ConversationStatus::Cancelled, Some("conversation cancelled".to_string())),
        };

        if let Err(e) = self.conversations.update_status(ctx.conversation.id, status).await {
            tracing::error!(conversation_id = ctx.conversation.id, error = %e, "failed to persist terminal status");
        }
        if let Err(e) = self
            .logs
            .update_metadata(
                log_id,
                ExecutionLogMetadata {
                    completed_at: Some(Some(self.clock.now_utc())),
                    error_message: Some(error_message),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(error = %e, "failed to stamp completed_at");
        }

        // Phase 13: result extraction from the freshly reloaded log.
        if let Err(e) = self.extract_result(ctx).await {
            tracing::warn!(conversation_id = ctx.conversation.id, error = %e, "result extraction failed");
        }

        // Phase 14: cleanup on non-success.
        if !matches!(outcome, Outcome::Success { .. }) {
            if let Some(rel) = rel {
                if let Err(e) = self.workspace.reset_to_clean(&rel).await {
                    tracing::warn!(conversation_id = ctx.conversation.id, error = %e, "workspace reset failed");
                }
            }
        }
    }

    async fn extract_result(&self, ctx: &ConversationContext) -> Result<()> {
        let Some(log) = self.logs.get_by_conversation_id(ctx.conversation.id).await? else {
            return Err(anyhow!("execution log vanished before result extraction"));
        };

        let parsed = ResultParser::parse(&log.execution_logs, ctx.conversation.id);
        let parsed = match parsed {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };

        if !self.results.exists_by_conversation_id(ctx.conversation.id).await? {
            self.results.create(parsed.clone()).await?;
        }
        if !parsed.session_id.is_empty() {
            self.tasks
                .update_fields(ctx.task.id, None, None, Some(&parsed.session_id))
                .await?;
        }
        Ok(())
    }

    async fn decrypt_credential(&self, credential: Option<&Credential>) -> Result<Option<Credential>> {
        let Some(credential) = credential else {
            return Ok(None);
        };
        crate::workspace::validate_credential(credential)?;
        let secret = self.decryptor.decrypt(credential).await?;
        Ok(Some(Credential {
            kind: credential.kind,
            username: credential.username.clone(),
            secret,
        }))
    }

    fn session_dir_abs(&self, dev_environment: &DevEnvironment) -> Option<PathBuf> {
        if container::is_running_in_container() {
            return None;
        }
        dev_environment
            .session_dir
            .as_deref()
            .map(|dir| PathBuf::from(&crate::config::settings().session_base_dir).join(dir))
    }

    fn config_log_batch_size(&self) -> usize {
        crate::config::settings().log_batch_size
    }

    fn config_log_flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(crate::config::settings().log_flush_interval_millis)
    }

    /// Permitted only if `conv_id` is `failed` or `cancelled`, not
    /// currently running, and admission capacity is available.
    pub async fn retry(&self, conv_id: ConversationId, caller: &str) -> Result<()> {
        let conv = self
            .conversations
            .get_by_id(conv_id)
            .await?
            .ok_or_else(|| anyhow!("conversation {conv_id} not found"))?;

        if !matches!(conv.status, ConversationStatus::Failed | ConversationStatus::Cancelled) {
            return Err(anyhow!("conversation {conv_id} is not in a retryable state"));
        }
        if self.registry.is_running(conv_id) {
            return Err(anyhow!("conversation {conv_id} is already running"));
        }
        if !self.registry.can_admit() {
            return Err(anyhow!("no admission capacity available"));
        }

        tracing::info!(conversation_id = conv_id, caller, "retrying conversation");
        self.logs.delete_by_conversation_id(conv_id).await?;
        self.conversations
            .update_status(conv_id, ConversationStatus::Pending)
            .await?;

        let now = self.clock.now_utc();
        let pending = self
            .conversations
            .fetch_pending_with_details(now)
            .await?
            .into_iter()
            .find(|p| p.conversation.id == conv_id)
            .ok_or_else(|| anyhow!("conversation {conv_id} not found after reset to pending"))?;

        if let Err(e) = self.run(pending).await {
            self.conversations.update_status(conv_id, ConversationStatus::Failed).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Permitted only if `conv_id` is `pending` or `running`.
    pub async fn cancel(&self, conv_id: ConversationId, caller: &str) -> Result<()> {
        let conv = self
            .conversations
            .get_by_id(conv_id)
            .await?
            .ok_or_else(|| anyhow!("conversation {conv_id} not found"))?;

        if !matches!(conv.status, ConversationStatus::Pending | ConversationStatus::Running) {
            return Err(anyhow!("cannot cancel a terminal conversation"));
        }

        tracing::info!(conversation_id = conv_id, caller, "cancelling conversation");
        self.registry.cancel(conv_id);

        self.conversations
            .update_status(conv_id, ConversationStatus::Cancelled)
            .await?;

        if let Some(task) = self.tasks.get_by_id(conv.task_id).await? {
            if !task.workspace_path.is_empty() {
                if let Err(e) = self.workspace.reset_to_clean(&task.workspace_path).await {
                    tracing::warn!(conversation_id = conv_id, error = %e, "workspace reset on cancel failed");
                }
            }
        }
        Ok(())
    }
}

/// `xsha/<createdBy>/<slug(title,<=30)>-<YYYYMMDD-HHMMSS>` (spec.md §4.3
/// phase 8).
fn synthesize_work_branch(created_by: &str, title: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    let slug = slugify(title, 30);
    format!("xsha/{created_by}/{slug}-{}", now.format("%Y%m%d-%H%M%S"))
}

fn slugify(title: &str, max_len: usize) -> String {
    let lowered = title.to_lowercase();
    let mut slug: String = lowered
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    slug.truncate(max_len);
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn slugify_lowercases_and_strips_non_ascii_alnum() {
        assert_eq!(slugify("Fix the Login Bug!!", 30), "fix-the-login-bug");
    }

    #[test]
    fn slugify_truncates_to_max_len() {
        let long_title = "a".repeat(50);
        assert_eq!(slugify(&long_title, 30).len(), 30);
    }

    #[test]
    fn slugify_empty_title_falls_back_to_task() {
        assert_eq!(slugify("!!!", 30), "task");
    }

    #[test]
    fn slugify_trims_leading_trailing_dashes() {
        assert_eq!(slugify("  hello world  ", 30), "hello-world");
    }

    #[test]
    fn synthesize_work_branch_matches_format() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 7, 31, 10, 30, 0).unwrap();
        let branch = synthesize_work_branch("alice", "hello", now);
        assert_eq!(branch, "xsha/alice/hello-20260731-103000");
    }
}
