use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::assembler::ConversationAssembler;
use crate::image_utils::optimize_batch;
use crate::runtime::GenerationParams;
use crate::session::{ChatMessage, ChatSession};
use crate::storage::SessionUpsert;
use crate::writer::SessionWriter;

/// Where and how chat attachments are shrunk before use.
#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    pub out_dir: PathBuf,
    pub max_width: u32,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub session_id: String,
    pub user: ChatMessage,
    pub reply: ChatMessage,
}

/// The "send message" flow of the chat screen.
pub struct ChatService {
    writer: Arc<SessionWriter>,
    assembler: ConversationAssembler,
    attachments: Option<AttachmentPolicy>,
    params: GenerationParams,
}

impl ChatService {
    pub fn new(writer: Arc<SessionWriter>, assembler: ConversationAssembler) -> Self {
        Self { writer, assembler, attachments: None, params: GenerationParams::default() }
    }

    pub fn with_attachments(mut self, policy: AttachmentPolicy) -> Self {
        self.attachments = Some(policy);
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub async fn open(&self, id: &str) -> Option<ChatSession> {
        self.writer.repository().get_session(id).await
    }

    /// Appends a user turn, saves, asks the model, appends the reply, saves again.
    /// The session is persisted before the model is called so the user's turn
    /// survives a slow or failed inference. A pin toggled while the model runs
    /// is kept, since the writer takes pin state from the stored row.
    pub async fn send(&self, session_id: Option<&str>, text: &str, images: Vec<String>) -> anyhow::Result<ChatTurn> {
        let (mut messages, is_pinned) = match session_id {
            Some(id) => match self.open(id).await {
                Some(s) => (s.messages, s.is_pinned),
                None => (Vec::new(), false),
            },
            None => (Vec::new(), false),
        };

        let images = match &self.attachments {
            Some(p) if !images.is_empty() => optimize_batch(&images, &p.out_dir, p.max_width, p.quality).await,
            _ => images,
        };
        let user = ChatMessage::user(text.trim(), images);
        if user.is_blank() {
            anyhow::bail!("message has neither text nor images");
        }
        messages.push(user.clone());

        let draft = SessionUpsert { existing_id: session_id.map(str::to_string), messages: messages.clone(), is_pinned };
        let id = self
            .writer
            .submit(draft)
            .await
            .ok_or_else(|| anyhow::anyhow!("session was not saved"))?;

        let reply = ChatMessage::assistant(self.assembler.respond(&messages, &self.params).await);
        messages.push(reply.clone());
        self.writer
            .submit(SessionUpsert { existing_id: Some(id.clone()), messages, is_pinned })
            .await;
        info!(session_id = %id, "chat turn completed");

        Ok(ChatTurn { session_id: id, user, reply })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::HISTORY_WINDOW;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::gateway::CHAT_FALLBACK;
    use crate::runtime::ModelGateway;
    use crate::session::Role;
    use crate::storage::{SessionRepository, SqliteStore};
    use tempfile::tempdir;

    async fn service(rt: Arc<FakeRuntime>) -> (tempfile::TempDir, Arc<SqliteStore>, ChatService) {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").to_string_lossy());
        let store = Arc::new(SqliteStore::initialize(Some(url)).await.unwrap());
        let writer = Arc::new(SessionWriter::new(store.clone()));
        let assembler = ConversationAssembler::new(Arc::new(ModelGateway::new(rt, "m")), HISTORY_WINDOW);
        (dir, store, ChatService::new(writer, assembler))
    }

    #[tokio::test]
    async fn first_message_creates_session_with_reply() {
        let (_dir, store, chat) = service(Arc::new(FakeRuntime::replying("Hi there!"))).await;
        let turn = chat.send(None, "Hello", vec![]).await.unwrap();
        assert_eq!(turn.reply.content, "Hi there!");

        let session = store.get_session(&turn.session_id).await.unwrap();
        assert_eq!(session.title, "Hello");
        assert_eq!(session.last_message, "Hi there!");
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn follow_up_extends_the_same_session() {
        let rt = Arc::new(FakeRuntime::replying("ok"));
        let (_dir, store, chat) = service(rt.clone()).await;
        let first = chat.send(None, "Hello", vec![]).await.unwrap();
        store.toggle_pin(&first.session_id).await;

        let second = chat.send(Some(&first.session_id), "", vec!["file:///p/a.jpg".into()]).await.unwrap();
        assert_eq!(second.session_id, first.session_id);

        let sessions = store.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].messages.len(), 4);
        assert!(sessions[0].is_pinned);

        let sent = rt.last_request().unwrap().messages;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].images, vec!["/p/a.jpg".to_string()]);
        assert_eq!(sent[2].content, "Analyze this image.");
    }

    #[tokio::test]
    async fn runtime_failure_still_records_both_turns() {
        let (_dir, store, chat) = service(Arc::new(FakeRuntime::failing("native crash"))).await;
        let turn = chat.send(None, "describe", vec![]).await.unwrap();
        assert_eq!(turn.reply.content, CHAT_FALLBACK);
        assert_eq!(store.get_session(&turn.session_id).await.unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let rt = Arc::new(FakeRuntime::replying("unused"));
        let (_dir, store, chat) = service(rt.clone()).await;
        assert!(chat.send(None, "   ", vec![]).await.is_err());
        assert!(store.list_sessions().await.is_empty());
        assert!(rt.last_request().is_none());
    }

    #[tokio::test]
    async fn pin_toggled_during_inference_survives_the_reply() {
        let rt = Arc::new(FakeRuntime {
            load_delay: Some(std::time::Duration::from_millis(200)),
            ..FakeRuntime::replying("late reply")
        });
        let (_dir, store, chat) = service(rt).await;
        let chat = Arc::new(chat);
        let id = chat
            .writer
            .submit(SessionUpsert {
                existing_id: Some("s1".into()),
                messages: vec![ChatMessage::user("earlier", vec![])],
                ..Default::default()
            })
            .await
            .unwrap();

        let turn = tokio::spawn({
            let chat = chat.clone();
            async move { chat.send(Some("s1"), "Hello", vec![]).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        chat.writer.toggle_pin(&id).await;
        assert!(store.get_session(&id).await.unwrap().is_pinned);

        let turn = turn.await.unwrap().unwrap();
        assert_eq!(turn.reply.content, "late reply");
        let session = store.get_session(&id).await.unwrap();
        assert!(session.is_pinned);
        assert_eq!(session.messages.len(), 3);
    }
}
