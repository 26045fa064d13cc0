//! Repository trait surface the core consumes (spec.md §6). The schema
//! choice behind these traits is an explicit non-goal of this core; the
//! traits are the contract. Grounded on the teacher's `Database` struct
//! being the one seam every subsystem calls through (`database.rs`),
//! generalized into traits so no concrete schema is baked into the core
//! itself.

use crate::errors::CredentialError;
use crate::models::*;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;

/// A conversation row joined with its task, project, and dev-environment,
/// as returned by the scheduler's pending-work query (spec.md §4.1 step 1).
#[derive(Debug, Clone)]
pub struct PendingConversation {
    pub conversation: Conversation,
    pub task: Option<Task>,
    pub project: Option<Project>,
    pub dev_environment: Option<DevEnvironment>,
}

pub trait ConversationRepository: Send + Sync {
    fn fetch_pending_with_details(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<PendingConversation>>> + Send;

    fn get_by_id(
        &self,
        id: ConversationId,
    ) -> impl Future<Output = Result<Option<Conversation>>> + Send;

    fn update_status(
        &self,
        id: ConversationId,
        status: ConversationStatus,
    ) -> impl Future<Output = Result<()>> + Send;

    fn update_commit_hash(
        &self,
        id: ConversationId,
        commit_hash: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub trait TaskRepository: Send + Sync {
    fn get_by_id(&self, id: TaskId) -> impl Future<Output = Result<Option<Task>>> + Send;

    fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Persist a newly assigned `workspace_path`, `work_branch`, or
    /// `session_id`. All three are write-through-once fields per spec.md
    /// §3's invariants; callers pass only the fields that changed.
    fn update_fields(
        &self,
        id: TaskId,
        workspace_path: Option<&str>,
        work_branch: Option<&str>,
        session_id: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub trait ExecutionLogRepository: Send + Sync {
    fn create(
        &self,
        conversation_id: ConversationId,
    ) -> impl Future<Output = Result<ExecutionLogId>> + Send;

    fn get_by_id(
        &self,
        id: ExecutionLogId,
    ) -> impl Future<Output = Result<Option<ExecutionLog>>> + Send;

    fn get_by_conversation_id(
        &self,
        conversation_id: ConversationId,
    ) -> impl Future<Output = Result<Option<ExecutionLog>>> + Send;

    fn append_log(&self, id: ExecutionLogId, text: &str) -> impl Future<Output = Result<()>> + Send;

    fn update_metadata(
        &self,
        id: ExecutionLogId,
        metadata: ExecutionLogMetadata,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_by_conversation_id(
        &self,
        conversation_id: ConversationId,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub trait ResultRepository: Send + Sync {
    fn create(&self, result: ConversationResult) -> impl Future<Output = Result<()>> + Send;

    fn exists_by_conversation_id(
        &self,
        conversation_id: ConversationId,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// Which secret field to decrypt on a [`Credential`] (the model already
/// carries plaintext in this core's boundary; real deployments decrypt at
/// the repository layer before handing a `Credential` to the core — this
/// trait exists so the core never assumes plaintext is already resident
/// and can be swapped for a real decryptor).
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<String, CredentialError>> + Send;
}

/// spec.md §6: `SystemConfig` surface (timeouts, proxy, SSL flags). The
/// default implementation reads from [`crate::config::settings`].
pub trait SystemConfig: Send + Sync {
    fn docker_timeout(&self) -> std::time::Duration;
    fn git_clone_timeout(&self) -> std::time::Duration;
    fn git_ssl_verify(&self) -> bool;
    fn proxy(&self) -> ProxyConfig;
}

#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

pub struct DefaultSystemConfig;

impl SystemConfig for DefaultSystemConfig {
    fn docker_timeout(&self) -> std::time::Duration {
        crate::config::settings().container_timeout()
    }

    fn git_clone_timeout(&self) -> std::time::Duration {
        crate::config::settings().git_clone_timeout()
    }

    fn git_ssl_verify(&self) -> bool {
        crate::config::settings().git_ssl_verify
    }

    fn proxy(&self) -> ProxyConfig {
        let s = crate::config::settings();
        ProxyConfig {
            enabled: s.proxy_enabled,
            http_proxy: s.http_proxy.clone(),
            https_proxy: s.https_proxy.clone(),
            no_proxy: s.no_proxy.clone(),
        }
    }
}

/// In-memory reference implementations of the repository traits above,
/// used only by this crate's own tests — never a production surface.
/// spec.md explicitly places persistence schema choice outside the core;
/// a trait with no implementation at all cannot be exercised in tests, so
/// this module exists purely to make the driver/scheduler testable.
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryRepos {
        pub tasks: Mutex<HashMap<TaskId, Task>>,
        pub projects: Mutex<HashMap<ProjectId, Project>>,
        pub dev_environments: Mutex<HashMap<DevEnvironmentId, DevEnvironment>>,
        pub conversations: Mutex<HashMap<ConversationId, Conversation>>,
        pub logs: Mutex<HashMap<ExecutionLogId, ExecutionLog>>,
        pub next_log_id: Mutex<ExecutionLogId>,
        pub results: Mutex<HashMap<ConversationId, ConversationResult>>,
    }

    impl InMemoryRepos {
        pub fn new() -> Self {
            Self {
                next_log_id: Mutex::new(1),
                ..Default::default()
            }
        }

        pub fn insert_task(&self, task: Task) {
            self.tasks.lock().unwrap().insert(task.id, task);
        }

        pub fn insert_project(&self, project: Project) {
            self.projects.lock().unwrap().insert(project.id, project);
        }

        pub fn insert_dev_environment(&self, env: DevEnvironment) {
            self.dev_environments.lock().unwrap().insert(env.id, env);
        }

        pub fn insert_conversation(&self, conv: Conversation) {
            self.conversations.lock().unwrap().insert(conv.id, conv);
        }
    }

    impl ConversationRepository for InMemoryRepos {
        async fn fetch_pending_with_details(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<PendingConversation>> {
            let convs = self.conversations.lock().unwrap();
            let tasks = self.tasks.lock().unwrap();
            let projects = self.projects.lock().unwrap();
            let envs = self.dev_environments.lock().unwrap();

            let mut pending: Vec<PendingConversation> = convs
                .values()
                .filter(|c| {
                    c.status == ConversationStatus::Pending
                        && c.execution_time.is_none_or(|t| t <= now)
                })
                .map(|c| {
                    let task = tasks.get(&c.task_id).cloned();
                    let project = task
                        .as_ref()
                        .and_then(|t| projects.get(&t.project_id).cloned());
                    let dev_environment = task
                        .as_ref()
                        .and_then(|t| envs.get(&t.dev_environment_id).cloned());
                    PendingConversation {
                        conversation: c.clone(),
                        task,
                        project,
                        dev_environment,
                    }
                })
                .collect();
            pending.sort_by_key(|p| p.conversation.created_at);
            Ok(pending)
        }

        async fn get_by_id(&self, id: ConversationId) -> Result<Option<Conversation>> {
            Ok(self.conversations.lock().unwrap().get(&id).cloned())
        }

        async fn update_status(&self, id: ConversationId, status: ConversationStatus) -> Result<()> {
            if let Some(c) = self.conversations.lock().unwrap().get_mut(&id) {
                c.status = status;
            }
            Ok(())
        }

        async fn update_commit_hash(&self, id: ConversationId, commit_hash: &str) -> Result<()> {
            if let Some(c) = self.conversations.lock().unwrap().get_mut(&id) {
                c.commit_hash = Some(commit_hash.to_string());
            }
            Ok(())
        }
    }

    impl TaskRepository for InMemoryRepos {
        async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>> {
            Ok(self.tasks.lock().unwrap().get(&id).cloned())
        }

        async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(&id) {
                t.status = status;
            }
            Ok(())
        }

        async fn update_fields(
            &self,
            id: TaskId,
            workspace_path: Option<&str>,
            work_branch: Option<&str>,
            session_id: Option<&str>,
        ) -> Result<()> {
            if let Some(t) = self.tasks.lock().unwrap().get_mut(&id) {
                if let Some(p) = workspace_path {
                    t.workspace_path = p.to_string();
                }
                if let Some(b) = work_branch {
                    t.work_branch = b.to_string();
                }
                if let Some(s) = session_id {
                    t.session_id = Some(s.to_string());
                }
            }
            Ok(())
        }
    }

    impl ExecutionLogRepository for InMemoryRepos {
        async fn create(&self, conversation_id: ConversationId) -> Result<ExecutionLogId> {
            let mut next = self.next_log_id.lock().unwrap();
            let id = *next;
            *next += 1;
            self.logs.lock().unwrap().insert(
                id,
                ExecutionLog {
                    id,
                    conversation_id,
                    execution_logs: String::new(),
                    docker_command: None,
                    error_message: None,
                    started_at: None,
                    completed_at: None,
                },
            );
            Ok(id)
        }

        async fn get_by_id(&self, id: ExecutionLogId) -> Result<Option<ExecutionLog>> {
            Ok(self.logs.lock().unwrap().get(&id).cloned())
        }

        async fn get_by_conversation_id(
            &self,
            conversation_id: ConversationId,
        ) -> Result<Option<ExecutionLog>> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .values()
                .find(|l| l.conversation_id == conversation_id)
                .cloned())
        }

        async fn append_log(&self, id: ExecutionLogId, text: &str) -> Result<()> {
            if let Some(l) = self.logs.lock().unwrap().get_mut(&id) {
                l.execution_logs.push_str(text);
            }
            Ok(())
        }

        async fn update_metadata(&self, id: ExecutionLogId, metadata: ExecutionLogMetadata) -> Result<()> {
            if let Some(l) = self.logs.lock().unwrap().get_mut(&id) {
                if let Some(v) = metadata.error_message {
                    l.error_message = v;
                }
                if let Some(v) = metadata.started_at {
                    l.started_at = v;
                }
                if let Some(v) = metadata.completed_at {
                    l.completed_at = v;
                }
                if let Some(v) = metadata.docker_command {
                    l.docker_command = v;
                }
            }
            Ok(())
        }

        async fn delete_by_conversation_id(&self, conversation_id: ConversationId) -> Result<()> {
            self.logs
                .lock()
                .unwrap()
                .retain(|_, l| l.conversation_id != conversation_id);
            Ok(())
        }
    }

    impl ResultRepository for InMemoryRepos {
        async fn create(&self, result: ConversationResult) -> Result<()> {
            self.results
                .lock()
                .unwrap()
                .insert(result.conversation_id, result);
            Ok(())
        }

        async fn exists_by_conversation_id(&self, conversation_id: ConversationId) -> Result<bool> {
            Ok(self.results.lock().unwrap().contains_key(&conversation_id))
        }
    }

    pub struct NullCredentialDecryptor;

    impl CredentialDecryptor for NullCredentialDecryptor {
        async fn decrypt(&self, credential: &Credential) -> Result<String, CredentialError> {
            Ok(credential.secret.clone())
        }
    }

    pub struct TestSystemConfig {
        pub docker_timeout: std::time::Duration,
        pub git_clone_timeout: std::time::Duration,
        pub git_ssl_verify: bool,
        pub proxy: ProxyConfig,
    }

    impl Default for TestSystemConfig {
        fn default() -> Self {
            Self {
                docker_timeout: std::time::Duration::from_secs(120 * 60),
                git_clone_timeout: std::time::Duration::from_secs(300),
                git_ssl_verify: true,
                proxy: ProxyConfig::default(),
            }
        }
    }

    impl SystemConfig for TestSystemConfig {
        fn docker_timeout(&self) -> std::time::Duration {
            self.docker_timeout
        }

        fn git_clone_timeout(&self) -> std::time::Duration {
            self.git_clone_timeout
        }

        fn git_ssl_verify(&self) -> bool {
            self.git_ssl_verify
        }

        fn proxy(&self) -> ProxyConfig {
            self.proxy.clone()
        }
    }
}
