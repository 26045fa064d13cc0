//! FIFO batch admission loop over pending conversations (spec.md §4.1).
//! Grounded on the teacher's `idle_monitor.rs` — a `tokio::time::interval`
//! ticker driving a per-tick function whose errors are logged, never
//! propagated — re-targeted from idle-container teardown to pending-
//! conversation dispatch.

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::container::ContainerExecutor;
use crate::driver::ConversationDriver;
use crate::registry::ExecutionRegistry;
use crate::repositories::{
    ConversationRepository, CredentialDecryptor, ExecutionLogRepository, ResultRepository,
    SystemConfig, TaskRepository,
};
use crate::workspace::WorkspaceManager;

/// Polls for pending, execution-time-eligible conversations and dispatches
/// each admitted one onto its own detached task, never waiting for a
/// dispatched conversation to finish before considering the next one
/// (spec.md §4.1 "admission is a queue pop, not a blocking call").
pub struct ConversationScheduler<C, T, L, R, D, S, K> {
    conversations: Arc<C>,
    registry: Arc<ExecutionRegistry>,
    clock: Arc<K>,
    poll_interval: Duration,
    driver: Arc<ConversationDriver<C, T, L, R, D, S, K>>,
}

impl<C, T, L, R, D, S, K> ConversationScheduler<C, T, L, R, D, S, K>
where
    C: ConversationRepository + 'static,
    T: TaskRepository + 'static,
    L: ExecutionLogRepository + 'static,
    R: ResultRepository + 'static,
    D: CredentialDecryptor + 'static,
    S: SystemConfig + 'static,
    K: Clock + 'static,
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
        poll_interval: Duration,
    ) -> Self {
        let driver = Arc::new(ConversationDriver::new(
            conversations.clone(),
            tasks,
            logs,
            results,
            decryptor,
            config,
            clock.clone(),
            workspace,
            container,
            registry.clone(),
        ));
        Self {
            conversations,
            registry,
            clock,
            poll_interval,
            driver,
        }
    }

    /// Runs the poll loop until `shutdown` fires. Each tick's dispatch
    /// errors are logged and never stop subsequent ticks — matching the
    /// teacher's `spawn_idle_monitor` error-handling contract.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut tick = interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.dispatch_pending().await {
                        tracing::error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One admission pass: fetch all eligible conversations ordered by
    /// `created_at`, skip any already running or over capacity, dispatch
    /// the rest onto detached tasks.
    ///
    /// Open question (spec.md §9): a conversation whose parent task has
    /// since been cancelled is still dispatched here — the fetch query
    /// has no task-status filter, and the invariant preventing new
    /// conversations on a cancelled task is enforced upstream of this
    /// core, not in the admission loop itself.
    async fn dispatch_pending(&self) -> anyhow::Result<()> {
        let now = self.clock.now_utc();
        let pending = self.conversations.fetch_pending_with_details(now).await?;

        for candidate in pending {
            if !self.registry.can_admit() {
                break;
            }
            if self.registry.is_running(candidate.conversation.id) {
                continue;
            }

            let driver = self.driver.clone();
            let conversation_id = candidate.conversation.id;
            tokio::spawn(async move {
                if let Err(e) = driver.run(candidate).await {
                    tracing::warn!(conversation_id, error = %e, "conversation dispatch failed");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Conversation, ConversationStatus, Credential, CredentialKind, DevEnvironment,
        DevEnvironmentType, Project, Task, TaskStatus,
    };
    use crate::repositories::testing::{InMemoryRepos, NullCredentialDecryptor, TestSystemConfig};
    use crate::clock::SystemClock;

    fn setup() -> (
        Arc<InMemoryRepos>,
        ConversationScheduler<
            InMemoryRepos,
            InMemoryRepos,
            InMemoryRepos,
            InMemoryRepos,
            NullCredentialDecryptor,
            TestSystemConfig,
            SystemClock,
        >,
    ) {
        let repos = Arc::new(InMemoryRepos::new());
        let config = Arc::new(TestSystemConfig::default());
        let clock = Arc::new(SystemClock);
        let workspace = Arc::new(WorkspaceManager::new("/tmp/xsha-scheduler-test", config.clone()));
        let container = Arc::new(ContainerExecutor::new(config.clone(), "docker"));
        let registry = Arc::new(ExecutionRegistry::new(2));

        let scheduler = ConversationScheduler::new(
            repos.clone(),
            repos.clone(),
            repos.clone(),
            repos.clone(),
            Arc::new(NullCredentialDecryptor),
            config,
            clock,
            workspace,
            container,
            registry,
            Duration::from_millis(10),
        );
        (repos, scheduler)
    }

    fn seed(repos: &InMemoryRepos, conv_id: i64) {
        repos.insert_task(Task {
            id: 1,
            project_id: 1,
            dev_environment_id: 1,
            title: "fix bug".to_string(),
            start_branch: "main".to_string(),
            work_branch: String::new(),
            workspace_path: String::new(),
            session_id: None,
            status: TaskStatus::Todo,
            created_by: "alice".to_string(),
        });
        repos.insert_project(Project {
            id: 1,
            repo_url: "https://example.com/org/repo.git".to_string(),
            credential: Some(Credential {
                kind: CredentialKind::Token,
                username: None,
                secret: "tok".to_string(),
            }),
            system_prompt: None,
        });
        repos.insert_dev_environment(DevEnvironment {
            id: 1,
            env_type: DevEnvironmentType::ClaudeCode,
            docker_image: "img:1".to_string(),
            cpu_limit: 1.0,
            memory_limit_mb: 256,
            env_vars: "{}".to_string(),
            session_dir: None,
            system_prompt: None,
        });
        repos.insert_conversation(Conversation {
            id: conv_id,
            task_id: 1,
            content: "hello".to_string(),
            env_params: Default::default(),
            status: ConversationStatus::Pending,
            execution_time: None,
            commit_hash: None,
            created_by: "alice".to_string(),
            created_at: chrono::Utc::now(),
        });
    }

    #[tokio::test]
    async fn dispatch_pending_skips_when_registry_is_full() {
        let (repos, scheduler) = setup();
        seed(&repos, 1);
        seed(&repos, 2);
        // Fill the registry to capacity (2) with unrelated ids.
        scheduler.registry.admit(100, CancellationToken::new());
        scheduler.registry.admit(101, CancellationToken::new());

        scheduler.dispatch_pending().await.unwrap();

        // Neither conversation should have been promoted out of pending,
        // since no admission slot was available.
        let conv1 = repos.conversations.lock().unwrap().get(&1).cloned().unwrap();
        assert_eq!(conv1.status, ConversationStatus::Pending);
    }

    #[tokio::test]
    async fn dispatch_pending_skips_already_running_conversation() {
        let (repos, scheduler) = setup();
        seed(&repos, 1);
        scheduler.registry.admit(1, CancellationToken::new());

        scheduler.dispatch_pending().await.unwrap();

        assert!(scheduler.registry.is_running(1));
        assert_eq!(scheduler.registry.running_count(), 1);
    }

    #[tokio::test]
    async fn dispatch_pending_is_ordered_by_created_at() {
        let (repos, scheduler) = setup();
        seed(&repos, 1);
        seed(&repos, 2);
        {
            let mut convs = repos.conversations.lock().unwrap();
            convs.get_mut(&1).unwrap().created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
            convs.get_mut(&2).unwrap().created_at = chrono::Utc::now();
        }

        let now = chrono::Utc::now();
        let pending = repos.fetch_pending_with_details(now).await.unwrap();
        assert_eq!(pending[0].conversation.id, 1);
        assert_eq!(pending[1].conversation.id, 2);
        let _ = scheduler;
    }
}
