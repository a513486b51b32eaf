//! Retry/failover across the credential pool.
//!
//! One logical call draws a random credential first and then walks the
//! pool sequentially. Recoverable failures (rate limit, free quota, no
//! content, no task ids) move on to the next credential until the attempt
//! budget, fixed at call start, is spent. Fatal failures end the call at
//! once. Streaming calls only fail over until their first output has been
//! committed to the caller.

use crate::api::models::{
    response_id, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ImageData,
    ImageGenerationRequest, ImageGenerationResponse,
};
use crate::core::background::BackgroundTasks;
use crate::core::config::{AppConfig, ConversationPolicy};
use crate::core::error::{AppError, Result};
use crate::core::error_types::FailureReason;
use crate::core::logging::truncate_for_log;
use crate::core::metrics::get_metrics;
use crate::core::token_counter::TokenCounter;
use crate::services::chat_stream::ChatStream;
use crate::services::credential_pool::{
    Credential, CredentialPool, CredentialStore, DrawStrategy, PoolError,
};
use crate::services::image_poller::{extract_task_ids, ImageTaskPoller};
use crate::services::image_sessions::ImageSessionMap;
use crate::services::session_registry::SessionAffinityRegistry;
use crate::services::upstream::{GensparkClient, ACCEPT_ANY, ACCEPT_EVENT_STREAM, ACCEPT_JSON};
use crate::transformer::media::MediaNormalizer;
use crate::transformer::request::{build_chat_payload, build_image_payload, ChatContext};
use crate::transformer::signatures::classify_failure;
use crate::transformer::stream::{Classified, LineDecoder, StreamClassifier};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const MAX_LOGGED_CHARS: usize = 500;

pub const KIND_CHAT: &str = "chat";
pub const KIND_STREAM: &str = "chat_stream";
pub const KIND_IMAGE: &str = "image";

/// Tunables taken from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub rate_limit_cooldown: Duration,
    pub free_limit_cooldown: Duration,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub policy: ConversationPolicy,
    pub debug: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
            free_limit_cooldown: Duration::from_secs(config.free_limit_cooldown_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            stream_timeout: Duration::from_secs(config.stream_timeout_secs),
            policy: config.conversation_policy,
            debug: config.debug,
        }
    }
}

/// Per-call failover state.
#[derive(Debug)]
pub struct RequestContext {
    pub kind: &'static str,
    pub credential: Credential,
    pub conversation_id: Option<String>,
    pub attempt: usize,
    pub max_attempts: usize,
}

impl RequestContext {
    fn new(kind: &'static str, credential: Credential, max_attempts: usize) -> Self {
        Self {
            kind,
            credential,
            conversation_id: None,
            attempt: 0,
            max_attempts,
        }
    }
}

/// Result of one dispatch that did not error at the transport level.
enum Attempt<T> {
    Success(T),
    Failed(FailureReason),
}

/// Where image calls draw (credential, conversation) pairs from.
enum ImageCandidates<'a> {
    Sessions(&'a ImageSessionMap),
    Pool(CredentialPool),
}

impl ImageCandidates<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Sessions(map) => map.len(),
            Self::Pool(pool) => pool.len(),
        }
    }

    fn draw(
        &mut self,
        strategy: DrawStrategy,
    ) -> std::result::Result<(Credential, Option<String>), PoolError> {
        match self {
            Self::Sessions(map) => map
                .draw(strategy)
                .map(|(credential, conversation_id)| (credential, Some(conversation_id))),
            Self::Pool(pool) => pool.draw(strategy).map(|credential| (credential, None)),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<OrchestratorSettings>,
    store: Arc<CredentialStore>,
    affinity: Arc<SessionAffinityRegistry>,
    image_sessions: Arc<ImageSessionMap>,
    model_chat_map: Arc<HashMap<String, String>>,
    client: GensparkClient,
    poller: ImageTaskPoller,
    background: BackgroundTasks,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, client: GensparkClient, background: BackgroundTasks) -> Self {
        Self {
            settings: Arc::new(OrchestratorSettings::from_config(config)),
            store: Arc::new(CredentialStore::new(&config.credentials)),
            affinity: Arc::new(SessionAffinityRegistry::new()),
            image_sessions: Arc::new(ImageSessionMap::new(config.image_session_map.clone())),
            model_chat_map: Arc::new(config.model_chat_map.clone()),
            poller: ImageTaskPoller::new(client.clone()),
            client,
            background,
        }
    }

    /// Replace the image task poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller = ImageTaskPoller::with_interval(self.client.clone(), interval);
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn affinity(&self) -> &SessionAffinityRegistry {
        &self.affinity
    }

    pub fn image_sessions(&self) -> &ImageSessionMap {
        &self.image_sessions
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Non-streaming chat completion.
    pub async fn chat_completion(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        with_timeout(self.settings.request_timeout, self.chat_completion_inner(request)).await
    }

    async fn chat_completion_inner(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let model = request.model.as_str();
        let mut pool = self.store.snapshot();
        let mut ctx = RequestContext::new(KIND_CHAT, pool.draw(DrawStrategy::Random)?, pool.len());

        loop {
            let (payload, counter) = self.prepare_chat(&mut ctx, &request.messages, model).await?;
            let outcome = match self.dispatch(&ctx, &payload, ACCEPT_JSON).await? {
                Attempt::Success(response) => {
                    let body = response.text().await?;
                    self.log_raw(&ctx, &body);
                    let mut classifier = StreamClassifier::new();
                    match classifier.classify_body(&body) {
                        Classified::Resolved { content } => {
                            Attempt::Success((content, classifier.conversation_id().map(str::to_string)))
                        }
                        Classified::Failed(reason) => {
                            self.log_failure(&ctx, reason, &body);
                            Attempt::Failed(reason)
                        }
                        _ => Attempt::Failed(FailureReason::NoContent),
                    }
                }
                Attempt::Failed(reason) => Attempt::Failed(reason),
            };

            match outcome {
                Attempt::Success((content, conversation_id)) => {
                    self.record_attempt(ctx.kind, "success");
                    let conversation_id = conversation_id.or(ctx.conversation_id.clone());
                    self.finish_chat(&ctx.credential, model, conversation_id);

                    let mut counter = counter;
                    counter.set_output(&content);
                    return Ok(ChatCompletionResponse::new(
                        response_id(),
                        model,
                        content,
                        counter.finalize(),
                    ));
                }
                Attempt::Failed(reason) => {
                    self.fail_over(&mut ctx, &mut pool, model, reason)?;
                }
            }
        }
    }

    /// Streaming chat completion.
    ///
    /// Returns once the first answer output is available; everything before
    /// that point may fail over to another credential.
    pub async fn chat_stream(&self, request: ChatCompletionRequest) -> Result<ChatStream> {
        with_timeout(self.settings.stream_timeout, self.chat_stream_inner(request)).await
    }

    async fn chat_stream_inner(&self, request: ChatCompletionRequest) -> Result<ChatStream> {
        let model = request.model.as_str();
        let mut pool = self.store.snapshot();
        let mut ctx =
            RequestContext::new(KIND_STREAM, pool.draw(DrawStrategy::Random)?, pool.len());

        loop {
            let (payload, counter) = self.prepare_chat(&mut ctx, &request.messages, model).await?;
            let outcome = match self.dispatch(&ctx, &payload, ACCEPT_EVENT_STREAM).await? {
                Attempt::Success(response) => self.open_stream(&ctx, response, model, counter).await?,
                Attempt::Failed(reason) => Attempt::Failed(reason),
            };

            match outcome {
                Attempt::Success(stream) => {
                    self.record_attempt(ctx.kind, "success");
                    return Ok(stream);
                }
                Attempt::Failed(reason) => {
                    self.fail_over(&mut ctx, &mut pool, model, reason)?;
                }
            }
        }
    }

    /// Read upstream lines until the first answer output commits the stream.
    async fn open_stream(
        &self,
        ctx: &RequestContext,
        response: reqwest::Response,
        model: &str,
        counter: TokenCounter,
    ) -> Result<Attempt<ChatStream>> {
        let mut upstream = response.bytes_stream().boxed();
        let mut decoder = LineDecoder::new();
        let mut classifier = StreamClassifier::new();
        let mut lines: VecDeque<String> = VecDeque::new();

        let committed = loop {
            let Some(line) = lines.pop_front() else {
                match upstream.next().await {
                    Some(Ok(chunk)) => lines.extend(decoder.push(&chunk)),
                    Some(Err(e)) => return Err(AppError::Request(e)),
                    None => match decoder.finish() {
                        Some(line) => lines.push_back(line),
                        None => match classifier.finish() {
                            Classified::Failed(reason) => {
                                self.log_failure(ctx, reason, "<stream ended>");
                                return Ok(Attempt::Failed(reason));
                            }
                            _ => return Ok(Attempt::Failed(FailureReason::NoContent)),
                        },
                    },
                }
                continue;
            };

            self.log_raw(ctx, &line);
            match classifier.feed_line(&line) {
                Classified::Failed(reason) => {
                    self.log_failure(ctx, reason, &line);
                    return Ok(Attempt::Failed(reason));
                }
                outcome @ (Classified::Delta(_) | Classified::Resolved { .. }) => break outcome,
                Classified::ProjectStarted(_) | Classified::Ignored => {}
            }
        };

        tracing::debug!(
            credential = %ctx.credential,
            attempt = ctx.attempt + 1,
            "Stream committed"
        );

        Ok(Attempt::Success(ChatStream::new(
            response_id(),
            model.to_string(),
            ctx.credential.clone(),
            ctx.conversation_id.clone(),
            committed,
            lines,
            upstream,
            decoder,
            classifier,
            counter,
            self.clone(),
        )))
    }

    /// Pick the conversation, normalize media and build the payload for
    /// the context's current credential.
    async fn prepare_chat(
        &self,
        ctx: &mut RequestContext,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<(crate::transformer::request::ChatPayload, TokenCounter)> {
        ctx.conversation_id = self.conversation_for(&ctx.credential, model);

        let mut messages = messages.to_vec();
        MediaNormalizer::new(&self.client, &ctx.credential)
            .normalize_messages(&mut messages)
            .await?;

        let chat_context = ctx
            .conversation_id
            .as_deref()
            .map_or_else(ChatContext::fresh, ChatContext::continuing);
        let payload = build_chat_payload(messages, model, &chat_context);
        let serialized = serde_json::to_string(&payload)
            .map_err(|e| AppError::Translation(format!("payload encoding failed: {}", e)))?;
        let counter = TokenCounter::new(model, &serialized);
        Ok((payload, counter))
    }

    /// Fixed model conversation first, then session affinity.
    fn conversation_for(&self, credential: &Credential, model: &str) -> Option<String> {
        self.model_chat_map
            .get(model)
            .cloned()
            .or_else(|| self.affinity.lookup(credential, model))
    }

    /// After a resolved chat: record affinity or delete the conversation.
    pub(crate) fn finish_chat(
        &self,
        credential: &Credential,
        model: &str,
        conversation_id: Option<String>,
    ) {
        let Some(conversation_id) = conversation_id else {
            return;
        };

        if self.settings.policy.should_record() {
            let affinity = self.affinity.clone();
            let credential = credential.clone();
            let model = model.to_string();
            self.background.submit("record_affinity", async move {
                affinity.record(&credential, &model, &conversation_id);
                Ok(())
            });
        } else if self.settings.policy.should_delete() {
            self.delete_unprotected(credential, conversation_id);
        }
    }

    fn delete_unprotected(&self, credential: &Credential, conversation_id: String) {
        if self.is_protected(credential, &conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                "Skipping delete of protected conversation"
            );
            return;
        }
        let client = self.client.clone();
        let credential = credential.clone();
        self.background.submit("delete_conversation", async move {
            client.delete_conversation(&credential, &conversation_id).await?;
            tracing::debug!(conversation_id = %conversation_id, "Deleted temporary conversation");
            Ok(())
        });
    }

    /// A conversation still referenced anywhere must survive cleanup.
    pub fn is_protected(&self, credential: &Credential, conversation_id: &str) -> bool {
        self.affinity
            .list_conversations(credential)
            .iter()
            .any(|id| id == conversation_id)
            || self.image_sessions.contains_conversation(conversation_id)
            || self.model_chat_map.values().any(|id| id == conversation_id)
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    pub async fn generate_images(
        &self,
        request: ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse> {
        with_timeout(self.settings.request_timeout, self.generate_images_inner(request)).await
    }

    async fn generate_images_inner(
        &self,
        request: ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse> {
        let mut candidates = if self.image_sessions.is_empty() {
            ImageCandidates::Pool(self.store.snapshot())
        } else {
            ImageCandidates::Sessions(self.image_sessions.as_ref())
        };
        let max_attempts = candidates.len();
        let (credential, conversation_id) = candidates.draw(DrawStrategy::Random)?;
        let mut ctx = RequestContext::new(KIND_IMAGE, credential, max_attempts);
        ctx.conversation_id = conversation_id;

        loop {
            let source = match &request.image {
                Some(reference) => Some(
                    MediaNormalizer::new(&self.client, &ctx.credential)
                        .normalize_reference(reference)
                        .await?
                        .into_content_item(),
                ),
                None => None,
            };
            let payload = build_image_payload(
                &request.prompt,
                &request.model,
                ctx.conversation_id.as_deref(),
                source,
            );

            let outcome = match self.dispatch(&ctx, &payload, ACCEPT_ANY).await? {
                Attempt::Success(response) => {
                    let body = response.text().await?;
                    self.log_raw(&ctx, &body);
                    match body.lines().find_map(classify_failure) {
                        Some(reason) => {
                            self.log_failure(&ctx, reason, &body);
                            Attempt::Failed(reason)
                        }
                        None => match extract_task_ids(&body) {
                            (_, task_ids) if task_ids.is_empty() => {
                                self.log_failure(&ctx, FailureReason::NoTaskIds, &body);
                                Attempt::Failed(FailureReason::NoTaskIds)
                            }
                            (conversation_id, task_ids) => {
                                Attempt::Success((conversation_id, task_ids))
                            }
                        },
                    }
                }
                Attempt::Failed(reason) => Attempt::Failed(reason),
            };

            match outcome {
                Attempt::Success((conversation_id, task_ids)) => {
                    self.record_attempt(ctx.kind, "success");
                    tracing::info!(
                        credential = %ctx.credential,
                        tasks = task_ids.len(),
                        "Image tasks dispatched"
                    );
                    let urls = self.poller.poll_all(&ctx.credential, &task_ids).await;

                    if self.settings.policy.should_delete() {
                        if let Some(id) = conversation_id.or(ctx.conversation_id.clone()) {
                            self.delete_unprotected(&ctx.credential, id);
                        }
                    }

                    return self.image_response(&request, urls).await;
                }
                Attempt::Failed(reason) => {
                    self.register_failure(&mut ctx, reason)?;
                    let (credential, conversation_id) = candidates.draw(DrawStrategy::Sequential)?;
                    ctx.credential = credential;
                    ctx.conversation_id = conversation_id;
                }
            }
        }
    }

    async fn image_response(
        &self,
        request: &ImageGenerationRequest,
        urls: Vec<String>,
    ) -> Result<ImageGenerationResponse> {
        let mut data = Vec::with_capacity(urls.len());
        for url in urls {
            if request.wants_base64() {
                let bytes = self.client.download(&url).await?;
                data.push(ImageData {
                    b64_json: Some(STANDARD.encode(&bytes)),
                    ..Default::default()
                });
            } else {
                data.push(ImageData {
                    url: Some(url),
                    revised_prompt: Some(request.prompt.clone()),
                    ..Default::default()
                });
            }
        }
        Ok(ImageGenerationResponse {
            created: chrono::Utc::now().timestamp(),
            data,
        })
    }

    // ------------------------------------------------------------------
    // Shared attempt plumbing
    // ------------------------------------------------------------------

    /// Send one payload. Non-success statuses are classified from their body.
    async fn dispatch<T: serde::Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        payload: &T,
        accept: &str,
    ) -> Result<Attempt<reqwest::Response>> {
        tracing::debug!(
            kind = ctx.kind,
            credential = %ctx.credential,
            conversation_id = ?ctx.conversation_id,
            attempt = ctx.attempt + 1,
            max_attempts = ctx.max_attempts,
            "Dispatching upstream request"
        );

        let response = self.client.ask(&ctx.credential, payload, accept).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Attempt::Success(response));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    credential = %ctx.credential,
                    status = status.as_u16(),
                    error = %e,
                    "Failed to read upstream error body"
                );
                String::new()
            }
        };
        match classify_failure(&body).or_else(|| body.lines().find_map(classify_failure)) {
            Some(reason) => {
                self.log_failure(ctx, reason, &body);
                Ok(Attempt::Failed(reason))
            }
            None => {
                self.record_attempt(ctx.kind, "error");
                Err(AppError::UpstreamStatus {
                    status: status.as_u16(),
                    body: truncate_for_log(&body, MAX_LOGGED_CHARS),
                })
            }
        }
    }

    /// Apply failure bookkeeping for a chat attempt and move to the next credential.
    fn fail_over(
        &self,
        ctx: &mut RequestContext,
        pool: &mut CredentialPool,
        model: &str,
        reason: FailureReason,
    ) -> Result<()> {
        if reason == FailureReason::NoContent && ctx.conversation_id.is_some() {
            self.affinity.forget(&ctx.credential, model);
        }
        self.register_failure(ctx, reason)?;
        ctx.credential = pool.draw(DrawStrategy::Sequential)?;
        Ok(())
    }

    /// Count the failure and decide whether another attempt is allowed.
    fn register_failure(&self, ctx: &mut RequestContext, reason: FailureReason) -> Result<()> {
        let metrics = get_metrics();
        self.record_attempt(ctx.kind, reason.as_str());
        metrics
            .upstream_failures
            .with_label_values(&[reason.as_str()])
            .inc();

        if !reason.is_recoverable() {
            return Err(AppError::Upstream(reason));
        }

        match reason {
            FailureReason::RateLimited => self
                .store
                .mark_rate_limited(&ctx.credential, self.settings.rate_limit_cooldown),
            FailureReason::FreeQuotaExceeded => self
                .store
                .mark_rate_limited(&ctx.credential, self.settings.free_limit_cooldown),
            _ => {}
        }

        ctx.attempt += 1;
        if ctx.attempt >= ctx.max_attempts {
            tracing::warn!(
                kind = ctx.kind,
                attempts = ctx.attempt,
                last = %reason,
                "Credential pool exhausted"
            );
            return Err(AppError::CredentialsExhausted {
                attempts: ctx.attempt,
                last: reason,
            });
        }

        metrics
            .credential_failovers
            .with_label_values(&[ctx.kind, reason.as_str()])
            .inc();
        tracing::info!(
            kind = ctx.kind,
            credential = %ctx.credential,
            reason = %reason,
            attempt = ctx.attempt,
            max_attempts = ctx.max_attempts,
            "Switching credential after recoverable failure"
        );
        Ok(())
    }

    fn record_attempt(&self, kind: &str, outcome: &str) {
        get_metrics()
            .upstream_attempts
            .with_label_values(&[kind, outcome])
            .inc();
    }

    fn log_failure(&self, ctx: &RequestContext, reason: FailureReason, raw: &str) {
        tracing::warn!(
            kind = ctx.kind,
            credential = %ctx.credential,
            reason = %reason,
            raw = %truncate_for_log(raw, MAX_LOGGED_CHARS),
            "Upstream attempt failed"
        );
    }

    pub(crate) fn log_raw(&self, ctx: &RequestContext, raw: &str) {
        if self.settings.debug {
            tracing::debug!(
                kind = ctx.kind,
                raw = %truncate_for_log(raw, MAX_LOGGED_CHARS),
                "Upstream data"
            );
        }
    }
}

async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| AppError::Timeout)?
}
