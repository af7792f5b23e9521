//! Turn orchestration.
//!
//! [`DifyBot::reply`] runs one user turn end to end: session lookup, turn
//! counting, optional image upload, the mode-specific remote call and reply
//! composition. Every failure inside a turn is converted into a single text
//! fragment, so the host always gets something it can send.

use futures_util::FutureExt;
use relay_common::config::{AppMode, DifyConfig};
use relay_common::error::RelayError;
use relay_common::util::truncate_with_ellipsis;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::client::{ChatBackend, ChatRequest, ResponseMode, UploadFileRef, WorkflowRequest};
use crate::compose::{parse_answer, resolve_fragments};
use crate::media::ImageCache;
use crate::message::Reply;
use crate::session::{Session, SessionStore};

/// Where in a turn an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Upload,
    Chatbot,
    Stream,
    Workflow,
}

impl Stage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Chatbot => "chatbot",
            Self::Stream => "stream",
            Self::Workflow => "workflow",
        }
    }
}

#[derive(Debug)]
struct TurnFailure {
    stage: Stage,
    error: RelayError,
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> Result<T, TurnFailure>;
}

impl<T> AtStage<T> for relay_common::error::Result<T> {
    fn at(self, stage: Stage) -> Result<T, TurnFailure> {
        self.map_err(|error| TurnFailure { stage, error })
    }
}

/// Text sent to the user when a turn fails.
pub fn failure_text(error: &RelayError) -> String {
    format!("[DIFY] {error}")
}

/// The relay's orchestrator.
pub struct DifyBot {
    sessions: Arc<SessionStore>,
    images: Arc<ImageCache>,
    backend: Arc<dyn ChatBackend>,
    /// `None` when the configured app type is unknown
    mode: Option<AppMode>,
    file_base_url: String,
    upload_enabled: bool,
}

impl DifyBot {
    pub fn new(
        config: &DifyConfig,
        sessions: Arc<SessionStore>,
        images: Arc<ImageCache>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let mode = match config.app_mode() {
            Ok(mode) => Some(mode),
            Err(e) => {
                tracing::warn!(error = %e, "Unknown Dify app type, every turn will report it");
                None
            }
        };

        Self {
            sessions,
            images,
            backend,
            mode,
            file_base_url: config.file_base_url(),
            upload_enabled: config.image_upload_enable,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn images(&self) -> &Arc<ImageCache> {
        &self.images
    }

    /// Configured app mode, `None` if the app type is unknown.
    pub fn mode(&self) -> Option<AppMode> {
        self.mode
    }

    /// Whether inbound images are uploaded with the next chat request.
    /// Workflow runs never carry files.
    pub fn accepts_images(&self) -> bool {
        self.upload_enabled && matches!(self.mode, Some(AppMode::Chatbot | AppMode::Agent))
    }

    /// Drop expired sessions together with any image still pending for them.
    /// Returns how many sessions were removed.
    pub async fn purge_expired(&self) -> usize {
        let expired = self.sessions.purge_expired_keys();
        for key in &expired {
            if let Some(image) = self.images.take(key) {
                tracing::debug!(session_id = %key, image_id = %image.id, "Dropping image of expired session");
                image.discard().await;
            }
        }
        expired.len()
    }

    /// Answer one user turn.
    ///
    /// Turns on the same session key are serialized: the session stays
    /// locked until the reply is composed.
    pub async fn reply(&self, query: &str, user_id: &str, session_id: &str) -> Reply {
        tracing::info!(
            session_id,
            user_id,
            query = %truncate_with_ellipsis(query, 200),
            "Dify query"
        );

        let shared = self.sessions.get_or_create(session_id, user_id);
        let mut session = shared.lock().await;

        let turn = AssertUnwindSafe(self.run_turn(query, &mut session)).catch_unwind();
        let reply = match turn.await {
            Ok(Ok(reply)) => reply,
            Ok(Err(failure)) => {
                tracing::error!(
                    session_id,
                    stage = failure.stage.as_str(),
                    kind = failure.error.kind(),
                    timeout = failure.error.is_timeout(),
                    error = %failure.error,
                    "Dify turn failed"
                );
                Reply::text(failure_text(&failure.error))
            }
            Err(_) => {
                tracing::error!(session_id, "Dify turn panicked");
                Reply::text("[DIFY] internal error")
            }
        };

        if reply.is_empty() {
            tracing::warn!(session_id, "Dify returned an empty reply");
        } else {
            tracing::debug!(session_id, kinds = ?reply.kinds(), "Dify reply");
        }
        reply
    }

    async fn run_turn(&self, query: &str, session: &mut Session) -> Result<Reply, TurnFailure> {
        session.count_user_message();

        let Some(mode) = self.mode else {
            tracing::warn!(session_id = %session.session_id(), "Dify app type is misconfigured");
            return Ok(Reply::text(AppMode::MISCONFIGURED));
        };

        match mode {
            AppMode::Chatbot => self.handle_chatbot(query, session).await,
            AppMode::Agent => self.handle_agent(query, session).await,
            AppMode::Workflow => self.handle_workflow(query, session).await,
        }
    }

    fn adopt_conversation(session: &mut Session, conversation_id: &str) {
        if session.conversation_id().is_empty() && !conversation_id.is_empty() {
            tracing::debug!(
                session_id = %session.session_id(),
                conversation_id,
                "Bound session to Dify conversation"
            );
            session.set_conversation_id(conversation_id);
        }
    }

    fn chat_request(
        query: &str,
        session: &Session,
        mode: ResponseMode,
        files: Vec<UploadFileRef>,
    ) -> ChatRequest {
        ChatRequest::new(query, session.user(), mode)
            .with_conversation(session.conversation_id())
            .with_files(files)
    }

    async fn handle_chatbot(&self, query: &str, session: &mut Session) -> Result<Reply, TurnFailure> {
        let files = self.upload_pending_image(session).await.at(Stage::Upload)?;
        let request = Self::chat_request(query, session, ResponseMode::Blocking, files);

        let completion = self
            .backend
            .chat_blocking(&request)
            .await
            .at(Stage::Chatbot)?;
        Self::adopt_conversation(session, &completion.conversation_id);

        let fragments = resolve_fragments(&self.file_base_url, parse_answer(&completion.answer));
        Ok(Reply::new(fragments))
    }

    async fn handle_agent(&self, query: &str, session: &mut Session) -> Result<Reply, TurnFailure> {
        let files = self.upload_pending_image(session).await.at(Stage::Upload)?;
        let request = Self::chat_request(query, session, ResponseMode::Streaming, files);

        let streamed = self
            .backend
            .chat_streaming(&request)
            .await
            .at(Stage::Stream)?;
        Self::adopt_conversation(session, &streamed.conversation_id);

        Ok(Reply::new(resolve_fragments(
            &self.file_base_url,
            streamed.fragments,
        )))
    }

    async fn handle_workflow(&self, query: &str, session: &mut Session) -> Result<Reply, TurnFailure> {
        let request = WorkflowRequest::new(query, session.user());
        let response = self
            .backend
            .run_workflow(&request)
            .await
            .at(Stage::Workflow)?;
        tracing::debug!(
            session_id = %session.session_id(),
            run_id = ?response.workflow_run_id,
            status = ?response.data.status,
            "Workflow finished"
        );
        Ok(Reply::text(response.data.outputs.text))
    }

    /// Upload the image the user sent last, if any. The local copy is
    /// removed whether or not the upload succeeds.
    async fn upload_pending_image(
        &self,
        session: &Session,
    ) -> relay_common::error::Result<Vec<UploadFileRef>> {
        if !self.upload_enabled {
            return Ok(Vec::new());
        }
        let Some(image) = self.images.take(session.session_id()) else {
            return Ok(Vec::new());
        };

        tracing::debug!(
            session_id = %session.session_id(),
            path = %image.path.display(),
            "Uploading pending image"
        );
        let uploaded = self.backend.upload_file(&image.path, session.user()).await;
        image.discard().await;

        Ok(vec![UploadFileRef::local_image(uploaded?.id)])
    }
}
