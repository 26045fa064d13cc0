//! Thin uniform-unwinding helpers used by the driver (spec.md §4.9).
//! Grounded on the teacher's pattern of small helper methods on `Database`
//! in `database.rs` that bundle a status write with a log row write.

use std::sync::Arc;

use crate::models::{ConversationId, ConversationStatus, ExecutionLogId, ExecutionLogMetadata};
use crate::repositories::{ConversationRepository, ExecutionLogRepository};

pub struct StateManager<C, L> {
    conversations: Arc<C>,
    logs: Arc<L>,
}

impl<C, L> StateManager<C, L>
where
    C: ConversationRepository,
    L: ExecutionLogRepository,
{
    pub fn new(conversations: Arc<C>, logs: Arc<L>) -> Self {
        Self { conversations, logs }
    }

    /// Set `status=failed`; create an ExecutionLog carrying `error_message`.
    pub async fn set_failed(&self, conv: ConversationId, msg: &str) -> anyhow::Result<()> {
        self.conversations
            .update_status(conv, ConversationStatus::Failed)
            .await?;
        let log_id = self.logs.create(conv).await?;
        self.logs
            .update_metadata(
                log_id,
                ExecutionLogMetadata {
                    error_message: Some(Some(msg.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Semantically the same as [`Self::set_failed`] but used at points
    /// that represent unwinding a partially-initialized attempt rather
    /// than a hard terminal failure reached mid-execution.
    pub async fn rollback(&self, conv: ConversationId, msg: &str) -> anyhow::Result<()> {
        self.set_failed(conv, msg).await
    }

    /// Set conversation status; update execution log metadata only
    /// (`execution_logs` text is never touched here) with `error_message`.
    pub async fn rollback_to_state(
        &self,
        conv: ConversationId,
        exec_log: ExecutionLogId,
        status: ConversationStatus,
        msg: &str,
    ) -> anyhow::Result<()> {
        self.conversations.update_status(conv, status).await?;
        self.logs
            .update_metadata(
                exec_log,
                ExecutionLogMetadata {
                    error_message: Some(Some(msg.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::testing::InMemoryRepos;

    fn sample_conversation() -> crate::models::Conversation {
        crate::models::Conversation {
            id: 1,
            task_id: 1,
            content: "hello".to_string(),
            env_params: Default::default(),
            status: ConversationStatus::Running,
            execution_time: None,
            commit_hash: None,
            created_by: "alice".to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn set_failed_updates_status_and_creates_log_with_message() {
        let repos = Arc::new(InMemoryRepos::new());
        repos.insert_conversation(sample_conversation());
        let sm = StateManager::new(repos.clone(), repos.clone());

        sm.set_failed(1, "boom").await.unwrap();

        let conv = repos.conversations.lock().unwrap().get(&1).cloned().unwrap();
        assert_eq!(conv.status, ConversationStatus::Failed);
        let logs = repos.logs.lock().unwrap();
        let log = logs.values().find(|l| l.conversation_id == 1).unwrap();
        assert_eq!(log.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn rollback_to_state_never_touches_execution_logs_text() {
        let repos = Arc::new(InMemoryRepos::new());
        repos.insert_conversation(sample_conversation());
        let log_id = repos.create(1).await.unwrap();
        repos
            .append_log(log_id, "some captured output\n")
            .await
            .unwrap();
        let sm = StateManager::new(repos.clone(), repos.clone());

        sm.rollback_to_state(1, log_id, ConversationStatus::Pending, "retrying")
            .await
            .unwrap();

        let conv = repos.conversations.lock().unwrap().get(&1).cloned().unwrap();
        assert_eq!(conv.status, ConversationStatus::Pending);
        let log = repos.logs.lock().unwrap().get(&log_id).cloned().unwrap();
        assert_eq!(log.error_message.as_deref(), Some("retrying"));
        assert_eq!(log.execution_logs, "some captured output\n");
    }
}
