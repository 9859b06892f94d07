//! Per-connection photo session.
//!
//! A camera sends a JSON header frame, then the photo as a binary frame, and
//! repeats. Each photo is saved, validated, then either enrolled (promoted
//! into the identity store) or recognized, and every photo produces exactly
//! one reply plus one status event.

use crate::common::GracePolicy;
use crate::core::FaceAnalysisGateway;
use crate::service::protocol::{PhotoResponse, Purpose, SessionHeader, StatusEvent};
use crate::service::status::StatusHub;
use crate::storage::identity_store::identity_name;
use crate::storage::{SavedImage, TempFileManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const MULTIPLE_FACES_REPLY: &str =
    "Multiple faces detected. Please provide an image with only one face for registration.";
pub const MULTIPLE_FACES_EVENT: &str = "Multiple faces in registration attempt";

/// Everything a photo session needs, shared by all camera connections.
pub struct PhotoContext {
    pub files: Arc<TempFileManager>,
    pub gateway: FaceAnalysisGateway,
    pub hub: Arc<StatusHub>,
    pub identity_dir: PathBuf,
    pub grace: GracePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHeader,
    AwaitingPayload,
    Closed,
}

/// Transport-neutral inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// What to send back for one frame. `event` is published after `response`
/// reaches the camera.
#[derive(Debug, Clone)]
pub struct Reply {
    pub response: PhotoResponse,
    pub event: Option<StatusEvent>,
}

pub struct PhotoSession {
    ctx: Arc<PhotoContext>,
    peer: String,
    state: SessionState,
    purpose: Purpose,
    declared_length: Option<u64>,
}

impl PhotoSession {
    pub fn new(ctx: Arc<PhotoContext>, peer: impl Into<String>) -> Self {
        Self {
            ctx,
            peer: peer.into(),
            state: SessionState::AwaitingHeader,
            purpose: Purpose::Check,
            declared_length: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// Returns None when the frame needs no reply (a valid header).
    pub async fn handle_frame(&mut self, frame: Frame) -> Option<Reply> {
        match frame {
            Frame::Text(text) => self.handle_header(&text),
            Frame::Binary(bytes) => Some(self.handle_payload(&bytes).await),
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn handle_header(&mut self, text: &str) -> Option<Reply> {
        match SessionHeader::parse(text) {
            Ok(header) => {
                tracing::info!(
                    "[PHOTO_SERVER] Received header from {}: purpose={:?}, length={:?}",
                    self.peer, header.purpose, header.length
                );
                self.purpose = header.purpose;
                self.declared_length = header.length;
                self.state = SessionState::AwaitingPayload;
                None
            }
            Err(e) => {
                tracing::warn!("[PHOTO_SERVER] Bad header from {}: {}", self.peer, e);
                Some(Reply {
                    response: PhotoResponse::error(e.to_string()),
                    event: None,
                })
            }
        }
    }

    async fn handle_payload(&mut self, bytes: &[u8]) -> Reply {
        let reply = self.process_submission(bytes).await;
        self.declared_length = None;
        self.state = SessionState::AwaitingHeader;
        reply
    }

    async fn process_submission(&self, bytes: &[u8]) -> Reply {
        if let Some(declared) = self.declared_length {
            if declared != bytes.len() as u64 {
                tracing::debug!(
                    "Payload is {} bytes, header declared {}", bytes.len(), declared
                );
            }
        }

        let saved = match self.ctx.files.save(bytes).await {
            Ok(saved) => saved,
            Err(e) => {
                tracing::error!("[PHOTO_SERVER] Failed to save photo from {}: {}", self.peer, e);
                let message = format!("Failed to save image: {}", e);
                return Reply {
                    response: PhotoResponse::error(message.clone()),
                    event: Some(StatusEvent::error(message, &crate::common::time::now())),
                };
            }
        };
        tracing::info!("[PHOTO_SERVER] Received and saved photo: {}", saved.file_name);

        let validation = self.ctx.gateway.validate(&saved.path).await;
        if !validation.has_face {
            tracing::info!("[PHOTO_SERVER] Rejected {}: {}", saved.file_name, validation.message);
            self.dispose(&saved, self.ctx.grace.invalid);
            return Reply {
                response: PhotoResponse::error(validation.message.clone()),
                event: Some(StatusEvent::error(validation.message, &saved.received_at)),
            };
        }

        let response = match self.purpose {
            Purpose::Add => {
                if validation.is_ambiguous() {
                    tracing::info!("[PHOTO_SERVER] {} in enrollment photo", validation.message);
                    self.dispose(&saved, self.ctx.grace.invalid);
                    return Reply {
                        response: PhotoResponse::error(MULTIPLE_FACES_REPLY),
                        event: Some(StatusEvent::error(MULTIPLE_FACES_EVENT, &saved.received_at)),
                    };
                }
                self.enroll(&saved).await
            }
            Purpose::Check => {
                let recognition = self.ctx.gateway.recognize(&saved.path).await;
                self.dispose(&saved, self.ctx.grace.recognition);
                PhotoResponse::recognition(recognition)
            }
        };

        let event = StatusEvent::outcome(&response, &saved.received_at);
        Reply { response, event: Some(event) }
    }

    async fn enroll(&self, saved: &SavedImage) -> PhotoResponse {
        match self.ctx.files.promote(&saved.path, &self.ctx.identity_dir, &saved.received_at).await {
            Ok(destination) => {
                let person = identity_name(&destination).unwrap_or_default();
                tracing::info!("[PHOTO_SERVER] Added new face to DB: {}", destination.display());
                PhotoResponse::added(person)
            }
            Err(e) => {
                tracing::error!("[PHOTO_SERVER] Failed to enroll {}: {}", saved.file_name, e);
                self.dispose(saved, self.ctx.grace.invalid);
                PhotoResponse::error(format!("Failed to store enrolled face: {}", e))
            }
        }
    }

    fn dispose(&self, saved: &SavedImage, delay: Duration) {
        if let Err(e) = self.ctx.files.schedule_delete(&saved.path, delay) {
            tracing::warn!("Could not schedule cleanup of {}: {}", saved.file_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FaceAnalyzer, Recognition, Validation};
    use crate::service::protocol::Status;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct ScriptedAnalyzer {
        confidences: Vec<f32>,
        recognition: Recognition,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn validate(&self, _image: &Path) -> Validation {
            Validation::from_confidences(&self.confidences)
        }
        fn recognize(&self, _image: &Path) -> Recognition {
            self.recognition.clone()
        }
    }

    const INVALID_GRACE: Duration = Duration::from_secs(60);
    const RECOGNITION_GRACE: Duration = Duration::from_secs(120);

    fn context(dir: &TempDir, confidences: &[f32], recognition: Recognition) -> Arc<PhotoContext> {
        context_with_identity_dir(dir, dir.path().join("database"), confidences, recognition)
    }

    fn context_with_identity_dir(
        dir: &TempDir,
        identity_dir: PathBuf,
        confidences: &[f32],
        recognition: Recognition,
    ) -> Arc<PhotoContext> {
        let analyzer = ScriptedAnalyzer {
            confidences: confidences.to_vec(),
            recognition,
        };
        Arc::new(PhotoContext {
            files: TempFileManager::start(dir.path().join("temp")).unwrap(),
            gateway: FaceAnalysisGateway::new(Arc::new(analyzer), 1),
            hub: Arc::new(StatusHub::new(8)),
            identity_dir,
            grace: GracePolicy {
                invalid: INVALID_GRACE,
                recognition: RECOGNITION_GRACE,
            },
        })
    }

    fn identities(dir: &TempDir) -> Vec<PathBuf> {
        match std::fs::read_dir(dir.path().join("database")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn submit(session: &mut PhotoSession, header: &str, bytes: &[u8]) -> Reply {
        assert!(session.handle_frame(Frame::Text(header.to_string())).await.is_none());
        session.handle_frame(Frame::Binary(bytes.to_vec())).await.unwrap()
    }

    #[tokio::test]
    async fn faceless_photo_is_rejected_and_scheduled_with_short_grace() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = submit(&mut session, r#"{"purpose":"check","length":12345}"#, b"no face").await;

        assert_eq!(reply.response, PhotoResponse::error("No faces detected in the image"));
        let event = reply.event.unwrap();
        assert_eq!(event.status, Status::Error);
        assert_eq!(event.message.as_deref(), Some("No faces detected in the image"));

        let pending = ctx.files.pending_deletions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delay, INVALID_GRACE);
        assert!(identities(&dir).is_empty());
    }

    #[tokio::test]
    async fn faceless_enrollment_is_never_promoted() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.4], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = submit(&mut session, r#"{"purpose":"add"}"#, b"blurry").await;

        assert_eq!(reply.response.message.as_deref(), Some("No clear human faces detected"));
        assert_eq!(ctx.files.pending_deletions().len(), 1);
        assert!(identities(&dir).is_empty());
    }

    #[tokio::test]
    async fn single_face_enrollment_is_promoted_without_deletion() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.97], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = submit(&mut session, r#"{"purpose":"add","length":3}"#, b"abc").await;

        assert_eq!(reply.response.status, Status::Added);
        let person = reply.response.person.clone().unwrap();
        assert!(person.starts_with("user_"));

        let stored = identities(&dir);
        assert_eq!(stored.len(), 1);
        assert_eq!(identity_name(&stored[0]).unwrap(), person);
        assert_eq!(std::fs::read(&stored[0]).unwrap(), b"abc");
        assert!(ctx.files.pending_deletions().is_empty());

        let event = reply.event.unwrap();
        assert_eq!(event.status, Status::Added);
        assert_eq!(event.person, Some(person));
    }

    #[tokio::test]
    async fn multi_face_enrollment_is_rejected() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.95, 0.9], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = submit(&mut session, r#"{"purpose":"add"}"#, b"group photo").await;

        assert_eq!(reply.response, PhotoResponse::error(MULTIPLE_FACES_REPLY));
        assert_eq!(reply.event.unwrap().message.as_deref(), Some(MULTIPLE_FACES_EVENT));
        assert!(identities(&dir).is_empty());

        let pending = ctx.files.pending_deletions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delay, INVALID_GRACE);
    }

    #[tokio::test]
    async fn failed_promotion_replies_error_and_schedules_deletion() {
        let dir = tempdir().unwrap();
        // A regular file where the identity directory should be
        let blocker = dir.path().join("database");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let ctx = context_with_identity_dir(&dir, blocker.clone(), &[0.97], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = submit(&mut session, r#"{"purpose":"add"}"#, b"face").await;

        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.response.message.clone().unwrap().starts_with("Failed to store enrolled face"));
        let event = reply.event.unwrap();
        assert_eq!(event.status, Status::Error);
        assert_eq!(event.person.as_deref(), Some("N/A"));

        let pending = ctx.files.pending_deletions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delay, INVALID_GRACE);
        assert!(pending[0].path.exists());
        assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory");
    }

    #[tokio::test]
    async fn enrollment_with_wrong_typed_length_is_still_an_enrollment() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.97], Recognition::Granted { person: "alice".into() });
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = session
            .handle_frame(Frame::Text(r#"{"purpose":"add","length":"12345"}"#.into()))
            .await;
        assert!(reply.is_none());
        assert_eq!(session.purpose(), Purpose::Add);

        let reply = session.handle_frame(Frame::Binary(b"face".to_vec())).await.unwrap();
        assert_eq!(reply.response.status, Status::Added);
        assert_eq!(identities(&dir).len(), 1);
    }

    #[tokio::test]
    async fn null_purpose_resets_to_check() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.97], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        session.handle_frame(Frame::Text(r#"{"purpose":"add"}"#.into())).await;
        let reply = session.handle_frame(Frame::Text(r#"{"purpose":null,"length":-1}"#.into())).await;

        assert!(reply.is_none());
        assert_eq!(session.purpose(), Purpose::Check);
        let reply = session.handle_frame(Frame::Binary(b"face".to_vec())).await.unwrap();
        assert_eq!(reply.response.status, Status::Denied);
        assert!(identities(&dir).is_empty());
    }

    #[tokio::test]
    async fn recognition_is_scheduled_with_long_grace() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.95, 0.9], Recognition::Granted { person: "alice".into() });
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = submit(&mut session, r#"{"purpose":"check"}"#, b"alice").await;

        assert_eq!(reply.response.status, Status::Granted);
        assert_eq!(reply.response.person.as_deref(), Some("alice"));
        assert_eq!(reply.response.message.as_deref(), Some(""));

        let pending = ctx.files.pending_deletions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delay, RECOGNITION_GRACE);
        assert!(identities(&dir).is_empty());
    }

    #[tokio::test]
    async fn recognition_error_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.9], Recognition::Error { message: "model offline".into() });
        let mut session = PhotoSession::new(ctx, "test");

        let reply = submit(&mut session, "{}", b"x").await;

        assert_eq!(reply.response.status, Status::Error);
        assert_eq!(reply.response.message.as_deref(), Some("model offline"));
        assert_eq!(reply.event.unwrap().person.as_deref(), Some("N/A"));
    }

    #[tokio::test]
    async fn malformed_header_keeps_session_usable() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.9], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        session.handle_frame(Frame::Text(r#"{"purpose":"add"}"#.into())).await;
        let reply = session.handle_frame(Frame::Text("{oops".into())).await.unwrap();

        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.event.is_none());
        assert_eq!(session.purpose(), Purpose::Add);

        let reply = session.handle_frame(Frame::Binary(b"face".to_vec())).await.unwrap();
        assert_eq!(reply.response.status, Status::Added);
    }

    #[tokio::test]
    async fn payload_without_header_defaults_to_check_and_length_is_not_enforced() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.9], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");

        let reply = session.handle_frame(Frame::Binary(b"face".to_vec())).await.unwrap();
        assert_eq!(reply.response.status, Status::Denied);

        let reply = submit(&mut session, r#"{"purpose":"check","length":999999}"#, b"tiny").await;
        assert_eq!(reply.response.status, Status::Denied);
    }

    #[tokio::test]
    async fn state_follows_header_payload_cycle() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.9], Recognition::Denied);
        let mut session = PhotoSession::new(ctx, "test");
        assert_eq!(session.state(), SessionState::AwaitingHeader);

        session.handle_frame(Frame::Text(r#"{"purpose":"add"}"#.into())).await;
        assert_eq!(session.state(), SessionState::AwaitingPayload);

        session.handle_frame(Frame::Binary(b"face".to_vec())).await;
        assert_eq!(session.state(), SessionState::AwaitingHeader);
        // Purpose carries over until the next header
        assert_eq!(session.purpose(), Purpose::Add);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn save_failure_reports_error_and_schedules_nothing() {
        let dir = tempdir().unwrap();
        let ctx = context(&dir, &[0.9], Recognition::Denied);
        let mut session = PhotoSession::new(Arc::clone(&ctx), "test");
        std::fs::remove_dir_all(ctx.files.temp_dir()).unwrap();

        let reply = session.handle_frame(Frame::Binary(b"face".to_vec())).await.unwrap();

        assert_eq!(reply.response.status, Status::Error);
        assert!(reply.response.message.unwrap().starts_with("Failed to save image"));
        assert!(reply.event.is_some());
        assert!(ctx.files.pending_deletions().is_empty());
    }
}
