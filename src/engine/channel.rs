// src/engine/channel.rs

use async_trait::async_trait;

use crate::error::EngineError;
use crate::models::{
    block::{BlockReason, BlockRequest, BlockResponse, BlockStatus},
    session::{SaveProgressRequest, SessionPayload, SubmitRequest, SubmitResponse},
};

/// Persistence channel to the Time Authority.
///
/// The trait seam keeps the engine testable against an in-memory authority;
/// production uses the HTTP implementation below.
#[async_trait]
pub trait AuthorityChannel: Send + Sync + 'static {
    /// Fetches the full session payload: quiz config, prior progress, block
    /// and completion state. Its values are ground truth on every call.
    async fn fetch_session(&self) -> Result<SessionPayload, EngineError>;

    /// Request/response save used by the interactive and background paths.
    async fn save_progress(&self, req: &SaveProgressRequest) -> Result<(), EngineError>;

    /// Reports a violation; the response carries the authority-issued
    /// absolute expiry.
    async fn send_block(&self, reason: BlockReason) -> Result<BlockResponse, EngineError>;

    /// Read-only cross-check of the block countdown.
    async fn block_status(&self) -> Result<BlockStatus, EngineError>;

    async fn submit(&self, req: &SubmitRequest) -> Result<SubmitResponse, EngineError>;
}

/// reqwest-backed channel speaking the authority's HTTP surface.
pub struct HttpAuthorityChannel {
    client: reqwest::Client,
    base_url: String,
    quiz_id: i64,
    student_id: String,
}

impl HttpAuthorityChannel {
    pub fn new(base_url: impl Into<String>, quiz_id: i64, student_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            quiz_id,
            student_id: student_id.into(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/api/quiz/{}{}", self.base_url, self.quiz_id, suffix)
    }
}

#[async_trait]
impl AuthorityChannel for HttpAuthorityChannel {
    async fn fetch_session(&self) -> Result<SessionPayload, EngineError> {
        let payload = self
            .client
            .get(self.url(""))
            .header("x-student-id", &self.student_id)
            .send()
            .await?
            .error_for_status()?
            .json::<SessionPayload>()
            .await?;
        Ok(payload)
    }

    async fn save_progress(&self, req: &SaveProgressRequest) -> Result<(), EngineError> {
        self.client
            .post(self.url("/save-progress"))
            .header("x-student-id", &self.student_id)
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_block(&self, reason: BlockReason) -> Result<BlockResponse, EngineError> {
        let resp = self
            .client
            .post(self.url("/block"))
            .header("x-student-id", &self.student_id)
            .json(&BlockRequest { reason })
            .send()
            .await?
            .error_for_status()?
            .json::<BlockResponse>()
            .await?;
        Ok(resp)
    }

    async fn block_status(&self) -> Result<BlockStatus, EngineError> {
        let status = self
            .client
            .get(self.url("/block-status"))
            .header("x-student-id", &self.student_id)
            .send()
            .await?
            .error_for_status()?
            .json::<BlockStatus>()
            .await?;
        Ok(status)
    }

    async fn submit(&self, req: &SubmitRequest) -> Result<SubmitResponse, EngineError> {
        let resp = self
            .client
            .post(self.url("/submit"))
            .header("x-student-id", &self.student_id)
            .json(req)
            .send()
            .await?
            .error_for_status()?
            .json::<SubmitResponse>()
            .await?;
        Ok(resp)
    }
}
