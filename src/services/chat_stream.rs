//! A chat stream that has committed output to the caller.
//!
//! Produced by the orchestrator once the first answer output is known.
//! From here on no failover happens: an upstream failure ends the stream
//! without a stop item.

use crate::core::error_types::FailureReason;
use crate::core::logging::truncate_for_log;
use crate::core::metrics::get_metrics;
use crate::core::token_counter::{TokenCounter, TokenUsage};
use crate::services::credential_pool::Credential;
use crate::services::orchestrator::Orchestrator;
use crate::transformer::stream::{Classified, LineDecoder, StreamClassifier};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;

pub type UpstreamBytes = BoxStream<'static, reqwest::Result<Bytes>>;

/// One unit of committed output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Delta(String),
    Stop(TokenUsage),
}

pub struct ChatStream {
    id: String,
    model: String,
    credential: Credential,
    conversation_id: Option<String>,
    first: Classified,
    backlog: VecDeque<String>,
    upstream: UpstreamBytes,
    decoder: LineDecoder,
    classifier: StreamClassifier,
    counter: TokenCounter,
    orchestrator: Orchestrator,
}

impl ChatStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        model: String,
        credential: Credential,
        conversation_id: Option<String>,
        first: Classified,
        backlog: VecDeque<String>,
        upstream: UpstreamBytes,
        decoder: LineDecoder,
        classifier: StreamClassifier,
        counter: TokenCounter,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            id,
            model,
            credential,
            conversation_id,
            first,
            backlog,
            upstream,
            decoder,
            classifier,
            counter,
            orchestrator,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Drive the remaining upstream body, yielding deltas and a final stop.
    pub fn into_items(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        let Self {
            model,
            credential,
            conversation_id,
            first,
            mut backlog,
            mut upstream,
            mut decoder,
            mut classifier,
            mut counter,
            orchestrator,
            ..
        } = self;

        async_stream::stream! {
            let mut outcome = first;
            loop {
                match outcome {
                    Classified::Delta(delta) => {
                        counter.accumulate(&delta);
                        yield StreamItem::Delta(delta);
                    }
                    Classified::Resolved { content } => {
                        if counter.output().is_empty() && !content.is_empty() {
                            yield StreamItem::Delta(content.clone());
                        }
                        counter.set_output(&content);
                        let conversation_id = classifier
                            .conversation_id()
                            .map(str::to_string)
                            .or(conversation_id);
                        orchestrator.finish_chat(&credential, &model, conversation_id);
                        yield StreamItem::Stop(counter.finalize());
                        return;
                    }
                    Classified::Failed(reason) => {
                        abort(&credential, reason, "");
                        return;
                    }
                    Classified::ProjectStarted(_) | Classified::Ignored => {}
                }

                outcome = loop {
                    if let Some(line) = backlog.pop_front() {
                        match classifier.feed_line(&line) {
                            Classified::Failed(reason) => {
                                abort(&credential, reason, &line);
                                return;
                            }
                            other => break other,
                        }
                    }
                    match upstream.next().await {
                        Some(Ok(chunk)) => backlog.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            tracing::error!(
                                credential = %credential,
                                error = %e,
                                "Upstream stream broke after output was committed"
                            );
                            return;
                        }
                        None => match decoder.finish() {
                            Some(line) => backlog.push_back(line),
                            None => break classifier.finish(),
                        },
                    }
                };
            }
        }
    }
}

fn abort(credential: &Credential, reason: FailureReason, raw: &str) {
    get_metrics()
        .upstream_failures
        .with_label_values(&[reason.as_str()])
        .inc();
    tracing::error!(
        credential = %credential,
        reason = %reason,
        raw = %truncate_for_log(raw, 500),
        "Upstream failed after output was committed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::core::{AppConfig, BackgroundTasks};
    use crate::services::upstream::GensparkClient;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const HELLO: &str = r#"data: {"type":"message_field_delta","field_name":"session_state.answer","delta":"Hello"}"#;
    const WORLD: &str = r#"data: {"type":"message_field_delta","field_name":"session_state.answer","delta":" world"}"#;
    const RESULT: &str = r#"data: {"type":"message_result","content":"Hello world"}"#;

    fn orchestrator() -> Orchestrator {
        let lookup: HashMap<String, String> =
            [("GS_COOKIE".to_string(), "a".to_string())].into();
        let config = AppConfig::from_lookup(|key| lookup.get(key).cloned()).unwrap();
        let client = GensparkClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
        Orchestrator::new(&config, client, BackgroundTasks::start())
    }

    /// A stream committed on a "Hello" delta, with `rest` still to come.
    fn committed(orchestrator: &Orchestrator, rest: Vec<reqwest::Result<Bytes>>) -> ChatStream {
        let mut classifier = StreamClassifier::new();
        classifier.feed_line(r#"data: {"type":"project_start","id":"conv-1"}"#);
        let first = classifier.feed_line(HELLO);
        ChatStream::new(
            "chatcmpl-1".to_string(),
            "gpt-4o".to_string(),
            Credential::new("session_id=a"),
            None,
            first,
            VecDeque::new(),
            futures::stream::iter(rest).boxed(),
            LineDecoder::new(),
            classifier,
            TokenCounter::new("gpt-4o", "Hi"),
            orchestrator.clone(),
        )
    }

    fn chunk(lines: &[&str]) -> reqwest::Result<Bytes> {
        Ok(Bytes::from(format!("{}\n", lines.join("\n"))))
    }

    #[tokio::test]
    async fn test_completed_stream_ends_with_stop() {
        let orchestrator = orchestrator();
        let stream = committed(&orchestrator, vec![chunk(&[WORLD]), chunk(&[RESULT])]);

        let items: Vec<StreamItem> = stream.into_items().collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], StreamItem::Delta("Hello".to_string()));
        assert_eq!(items[1], StreamItem::Delta(" world".to_string()));
        assert_matches!(items[2], StreamItem::Stop(_));

        orchestrator.background().idle().await;
        let credential = Credential::new("session_id=a");
        assert_eq!(
            orchestrator.affinity().lookup(&credential, "gpt-4o").as_deref(),
            Some("conv-1")
        );
    }

    #[tokio::test]
    async fn test_failure_after_commit_ends_without_stop() {
        let orchestrator = orchestrator();
        let stream = committed(
            &orchestrator,
            vec![chunk(&["Rate limit exceeded cf1", RESULT])],
        );

        let items: Vec<StreamItem> = stream.into_items().collect().await;
        assert_eq!(items, vec![StreamItem::Delta("Hello".to_string())]);

        orchestrator.background().idle().await;
        let credential = Credential::new("session_id=a");
        assert_eq!(orchestrator.affinity().lookup(&credential, "gpt-4o"), None);
    }

    #[tokio::test]
    async fn test_transport_error_after_commit_ends_without_stop() {
        let transport_error = reqwest::get("http://127.0.0.1:9/").await.unwrap_err();
        let orchestrator = orchestrator();
        let stream = committed(
            &orchestrator,
            vec![chunk(&[WORLD]), Err(transport_error), chunk(&[RESULT])],
        );

        let items: Vec<StreamItem> = stream.into_items().collect().await;
        assert_eq!(
            items,
            vec![
                StreamItem::Delta("Hello".to_string()),
                StreamItem::Delta(" world".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_upstream_ending_without_result_ends_without_stop() {
        let orchestrator = orchestrator();
        let stream = committed(&orchestrator, vec![chunk(&[WORLD])]);

        let items: Vec<StreamItem> = stream.into_items().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| matches!(item, StreamItem::Delta(_))));
    }
}
