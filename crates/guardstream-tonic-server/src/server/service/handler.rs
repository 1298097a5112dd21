//! gRPC service implementation for safety-gated generation.
//!
//! [`TextGeneratorService`] implements the [`TextGenerator`] service. Each RPC
//! is turned into a [`GenerationContext`] plus a running [`SafeguardTask`] and
//! handed to the [`Orchestrator`] on its own task; the caller reads the gated
//! output from a bounded channel.
//!
//! ## Responsibilities
//!
//! - Validate requests and refuse new work during shutdown.
//! - Start the safety classification before the backend stream is consumed.
//! - Report failures to the caller as a final `Status` item, and log them
//!   with the request ID and the caller's metadata.

use crate::server::{
    backend::{ChatParams, GenerateParams, LlmBackend, ParamDefaults, SafeguardClient},
    config::ServerConfig,
    prompt::{backend_messages, flatten_chat},
    service::{
        lifecycle::{Lifecycle, StreamGuard},
        shape::{ChatShape, GenerateShape, InstTokens},
    },
    telemetry::{
        increment_chunks_streamed, increment_requests, increment_safeguard_timeouts,
        increment_stream_errors, increment_unsafe_prompts, record_stream_duration,
    },
};
use core::pin::Pin;
use futures::TryStreamExt;
use guardstream_tonic_core::{
    Error,
    guardstream::{
        self, GenerationContext, Orchestrator, Outcome, RefusalStreamer, ResponseShape,
        SafeguardTask,
    },
    proto::{
        ChatCompletionStreamRequest, ChatCompletionStreamResponse, GenerateStreamRequest,
        GenerateStreamResponse, text_generator_server::TextGenerator,
    },
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, metadata::MetadataMap};
use tracing::Instrument;

type ChunkStream<C> = Pin<Box<dyn Stream<Item = Result<C, Status>> + Send>>;

struct Inner {
    backend: LlmBackend,
    safeguard: SafeguardClient,
    refusal: RefusalStreamer,
    orchestrator: Orchestrator,
    inst_tokens: InstTokens,
    model: String,
    system_prompt: Option<String>,
    defaults: ParamDefaults,
    stream_buffer_size: usize,
    lifecycle: Lifecycle,
}

/// The `TextGenerator` gRPC service. Cheap to clone.
#[derive(Clone)]
pub struct TextGeneratorService {
    inner: Arc<Inner>,
}

impl TextGeneratorService {
    pub fn new(
        config: &ServerConfig,
        backend: LlmBackend,
        safeguard: SafeguardClient,
        refusal: RefusalStreamer,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                safeguard,
                refusal,
                orchestrator: Orchestrator::new(config.safeguard_wait),
                inst_tokens: InstTokens::new(&config.inst_tokens),
                model: config.model_id.clone().unwrap_or_default(),
                system_prompt: config.system_prompt.clone(),
                defaults: config.defaults,
                stream_buffer_size: config.stream_buffer_size,
                lifecycle,
            }),
        }
    }

    /// Admits a request, or rejects it with a status naming its ID.
    fn admit(&self, rpc: &'static str, request_id: &str) -> Result<StreamGuard, Status> {
        match self.inner.lifecycle.track() {
            Ok(guard) => {
                increment_requests(rpc);
                Ok(guard)
            }
            Err(err) => Err(reject(request_id, &err)),
        }
    }

    /// Runs the orchestrator for one request on its own task and returns the
    /// caller-facing stream.
    fn spawn_gated<S: ResponseShape>(
        &self,
        request_id: String,
        metadata: MetadataMap,
        ctx: GenerationContext<S>,
        safeguard: SafeguardTask,
        guard: StreamGuard,
    ) -> ChunkStream<S::Chunk> {
        let (tx, rx) = mpsc::channel::<Result<S::Chunk, Status>>(self.inner.stream_buffer_size);
        let orchestrator = self.inner.orchestrator;
        let cancelled = self.inner.lifecycle.cancelled();
        let span = tracing::info_span!("gated_stream", request_id = %request_id);

        let fut = async move {
            let _guard = guard;
            let start = std::time::Instant::now();

            let result = tokio::select! {
                result = orchestrator.run(ctx, safeguard, &tx) => result.map_err(Error::from),
                () = cancelled.cancelled() => Err(Error::ServiceShutdown),
            };
            record_stream_duration(start.elapsed().as_secs_f64() * 1000.0);

            match result {
                Ok(Outcome::Completed { chunks }) => {
                    tracing::debug!(chunks, "stream completed");
                }
                Ok(Outcome::Replaced {
                    harm_category,
                    discarded,
                    chunks,
                }) => {
                    increment_unsafe_prompts();
                    tracing::info!(%harm_category, discarded, chunks, "stream replaced by refusal");
                }
                Err(err) => {
                    log_failure(&request_id, &metadata, &err);
                    if matches!(err, Error::Engine(guardstream::Error::SafeguardNotResponsive { .. })) {
                        increment_safeguard_timeouts();
                    }
                    // Nobody is left to read a cancellation.
                    if !err.is_cancelled() {
                        let _ = tx.send(Err(err.to_status(&request_id))).await;
                    }
                }
            }
        };

        tokio::spawn(fut.instrument(span));

        let stream = ReceiverStream::new(rx)
            .inspect_ok(|_| increment_chunks_streamed(1))
            .inspect_err(|status| increment_stream_errors(status.code()));
        Box::pin(stream)
    }
}

#[tonic::async_trait]
impl TextGenerator for TextGeneratorService {
    type GenerateStreamStream = ChunkStream<GenerateStreamResponse>;
    type ChatCompletionStreamStream = ChunkStream<ChatCompletionStreamResponse>;

    #[tracing::instrument(name = "GenerateStream", skip_all, fields(request_id = %req.get_ref().request_id))]
    async fn generate_stream(
        &self,
        req: Request<GenerateStreamRequest>,
    ) -> Result<Response<Self::GenerateStreamStream>, Status> {
        let (metadata, _, request) = req.into_parts();
        tracing::info!("got new GenerateStreamRequest | request id: {}", request.request_id);
        tracing::debug!("request body: {request:?}");

        if request.prompt.trim().is_empty() {
            return Err(reject(
                &request.request_id,
                &Error::InvalidRequest {
                    reason: "prompt must not be empty".to_owned(),
                },
            ));
        }
        let guard = self.admit("GenerateStream", &request.request_id)?;

        let params = GenerateParams::normalize(
            &request.request_id,
            request.params.as_ref(),
            self.inner.defaults,
        );

        let safeguard = SafeguardTask::spawn(
            &request.prompt,
            self.inner.safeguard.classify(request.prompt.clone()),
        );
        let ctx = GenerationContext::new(
            self.inner.backend.generate_stream(&request.prompt, &params),
            GenerateShape::new(self.inner.inst_tokens.clone()),
            self.inner.refusal.clone(),
        );

        Ok(Response::new(self.spawn_gated(
            request.request_id,
            metadata,
            ctx,
            safeguard,
            guard,
        )))
    }

    #[tracing::instrument(name = "ChatCompletionStream", skip_all, fields(request_id = %req.get_ref().request_id))]
    async fn chat_completion_stream(
        &self,
        req: Request<ChatCompletionStreamRequest>,
    ) -> Result<Response<Self::ChatCompletionStreamStream>, Status> {
        let (metadata, _, request) = req.into_parts();
        tracing::info!(
            "got new ChatCompletionStreamRequest | request id: {}",
            request.request_id
        );
        tracing::debug!("request body: {request:?}");

        if request.messages.is_empty() {
            return Err(reject(
                &request.request_id,
                &Error::InvalidRequest {
                    reason: "messages must not be empty".to_owned(),
                },
            ));
        }
        let guard = self.admit("ChatCompletionStream", &request.request_id)?;

        let params = ChatParams::normalize(&request, self.inner.defaults);
        let raw_prompt = flatten_chat(&request.messages);
        let messages = backend_messages(&request.messages, self.inner.system_prompt.as_deref());

        let safeguard = SafeguardTask::spawn(&raw_prompt, self.inner.safeguard.classify(raw_prompt.clone()));
        let ctx = GenerationContext::new(
            self.inner.backend.chat_stream(messages, &params),
            ChatShape::new(
                &request.request_id,
                &self.inner.model,
                unix_now(),
                self.inner.inst_tokens.clone(),
            ),
            self.inner.refusal.clone(),
        );

        Ok(Response::new(self.spawn_gated(
            request.request_id,
            metadata,
            ctx,
            safeguard,
            guard,
        )))
    }
}

fn reject(request_id: &str, err: &Error) -> Status {
    tracing::warn!("Request ID: {request_id} | Error Msg: {err}");
    let status = err.to_status(request_id);
    increment_stream_errors(status.code());
    status
}

fn log_failure(request_id: &str, metadata: &MetadataMap, err: &Error) {
    if err.is_cancelled() {
        tracing::debug!("Request ID: {request_id} | cancelled by client");
    } else if err.wants_diagnostics() {
        tracing::error!(
            "Request ID: {request_id} | Error Msg: {err} | Invocation Meta: {metadata:?}\n{err:?}"
        );
    } else {
        tracing::warn!("Request ID: {request_id} | Error Msg: {err} | Invocation Meta: {metadata:?}");
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::CliArgs;
    use clap::Parser;
    use core::time::Duration;
    use futures::StreamExt;
    use guardstream_tonic_core::{
        guardstream::{SAFETY_STOP_REASON, TokenId, Tokenizer},
        proto::ChatMessage,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;
    use tonic::Code;

    /// One token per character.
    struct Chars;

    impl Tokenizer for Chars {
        fn encode(&self, text: &str) -> guardstream::Result<Vec<TokenId>> {
            Ok(text.chars().map(u32::from).collect())
        }

        fn decode(&self, ids: &[TokenId]) -> guardstream::Result<String> {
            Ok(ids.iter().filter_map(|id| char::from_u32(*id)).collect())
        }
    }

    enum Reply {
        Now,
        /// Holds the answer until `release` fires; answers 503 after 5s.
        After(Arc<Notify>),
        Never,
    }

    /// A local HTTP server answering every request with the same body.
    struct Upstream {
        base_url: String,
        /// Notified once per request received.
        seen: Arc<Notify>,
        requests: mpsc::UnboundedReceiver<String>,
    }

    async fn upstream(content_type: &'static str, body: String, reply: Reply) -> Upstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Notify::new());
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let reply = Arc::new(reply);

        let notify = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let notify = Arc::clone(&notify);
                let requests_tx = requests_tx.clone();
                let reply = Arc::clone(&reply);
                let body = body.clone();
                tokio::spawn(async move {
                    let _ = requests_tx.send(read_request(&mut socket).await);
                    notify.notify_one();

                    let status = match &*reply {
                        Reply::Now => "200 OK",
                        Reply::After(release) => {
                            match tokio::time::timeout(Duration::from_secs(5), release.notified()).await {
                                Ok(()) => "200 OK",
                                Err(_) => "503 Service Unavailable",
                            }
                        }
                        Reply::Never => return core::future::pending::<()>().await,
                    };
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Upstream {
            base_url: format!("http://{addr}"),
            seen,
            requests,
        }
    }

    /// Reads the head and the `content-length` body of one request.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn verdict(answer: &str) -> String {
        serde_json::json!({"choices": [{"message": {"content": answer}}]}).to_string()
    }

    fn tgi_events(pieces: &[&str]) -> String {
        let last = pieces.len() - 1;
        pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| {
                let event = serde_json::json!({
                    "token": {"id": i + 1, "text": piece, "logprob": -0.1, "special": false},
                    "generated_text": (i == last).then(|| pieces.concat()),
                    "details": (i == last).then(|| serde_json::json!({
                        "finish_reason": "eos_token",
                        "generated_tokens": pieces.len(),
                    })),
                });
                format!("data: {event}\n\n")
            })
            .collect()
    }

    fn service(backend_url: &str, safeguard_url: &str, extra: &[&str]) -> (TextGeneratorService, Lifecycle) {
        let mut argv = vec![
            "guardstream-tonic-server",
            "--backend-url",
            backend_url,
            "--safeguard-url",
            safeguard_url,
            "--tokenizer-path",
            "/models/tokenizer.json",
            "--safeguard-poll-interval-ms",
            "100",
        ];
        argv.extend_from_slice(extra);
        let config = ServerConfig::try_from(CliArgs::try_parse_from(argv).unwrap()).unwrap();
        let lifecycle = Lifecycle::new();
        let service = TextGeneratorService::new(
            &config,
            LlmBackend::from_config(&config).unwrap(),
            SafeguardClient::from_config(&config).unwrap(),
            RefusalStreamer::new(Arc::new(Chars)),
            lifecycle.clone(),
        );
        (service, lifecycle)
    }

    fn generate(request_id: &str, prompt: &str) -> Request<GenerateStreamRequest> {
        Request::new(GenerateStreamRequest {
            request_id: request_id.to_owned(),
            prompt: prompt.to_owned(),
            ..Default::default()
        })
    }

    async fn drain<C: Send + 'static>(stream: ChunkStream<C>) -> Vec<Result<C, Status>> {
        tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
            .await
            .unwrap()
    }

    fn token_texts(items: &[Result<GenerateStreamResponse, Status>]) -> Vec<String> {
        items
            .iter()
            .map(|item| item.as_ref().unwrap().token.as_ref().unwrap().text.clone())
            .collect()
    }

    #[tokio::test]
    async fn classification_starts_before_generation_is_read() {
        let mut safeguard = upstream("application/json", verdict("safe"), Reply::Now).await;
        // The backend only answers once the safeguard has its request.
        let backend = upstream(
            "text/event-stream",
            tgi_events(&["Hel", "lo"]),
            Reply::After(Arc::clone(&safeguard.seen)),
        )
        .await;
        let (service, _) = service(&backend.base_url, &safeguard.base_url, &[]);

        let stream = service
            .generate_stream(generate("req-1", "say hello"))
            .await
            .unwrap()
            .into_inner();
        let items = drain(stream).await;

        assert_eq!(token_texts(&items), vec!["Hel", "lo"]);
        let classified = safeguard.requests.recv().await.unwrap();
        assert!(classified.contains("say hello"));
        assert!(classified.contains("\"max_tokens\":20"));
    }

    #[tokio::test]
    async fn unsafe_prompt_is_replaced_by_refusal() {
        let safeguard = upstream("application/json", verdict("unsafe\nS10"), Reply::Now).await;
        let backend = upstream("text/event-stream", tgi_events(&["Sure", "!"]), Reply::Now).await;
        let (service, _) = service(&backend.base_url, &safeguard.base_url, &[]);

        let stream = service
            .generate_stream(generate("req-2", "something hateful"))
            .await
            .unwrap()
            .into_inner();
        let items = drain(stream).await;

        let texts = token_texts(&items);
        assert!(!texts.iter().any(|text| text == "Sure"));
        let last = items.last().unwrap().as_ref().unwrap();
        let details = last.details.as_ref().unwrap();
        assert_eq!(details.finish_reason, SAFETY_STOP_REASON);
        assert_eq!(details.generated_tokens as usize, items.len());

        let refusal = last.generated_text.as_deref().unwrap();
        assert_eq!(texts.concat(), refusal);
        assert!(refusal.starts_with("I'm sorry"));
        assert!(refusal.ends_with("category: Hate."));
    }

    #[tokio::test]
    async fn silent_safeguard_fails_the_stream() {
        let safeguard = upstream("application/json", verdict("safe"), Reply::Never).await;
        let backend = upstream("text/event-stream", tgi_events(&["Hi"]), Reply::Now).await;
        let (service, _) = service(
            &backend.base_url,
            &safeguard.base_url,
            &["--safeguard-timeout-secs", "1"],
        );

        let stream = service
            .generate_stream(generate("req-3", "hello?"))
            .await
            .unwrap()
            .into_inner();
        let items = drain(stream).await;

        // Buffered chunks never reach the caller without a verdict.
        assert_eq!(items.len(), 1);
        let status = items[0].as_ref().unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().starts_with("Request ID: req-3 | Error Msg:"));
        assert!(status.message().contains("safeguard did not respond within 1s"));
    }

    #[tokio::test]
    async fn safe_chat_passes_through() {
        let chunks = [
            serde_json::json!({"id": "c1", "created": 1, "model": "m", "choices": [
                {"index": 0, "delta": {"role": "assistant", "content": "Hel"}}
            ]}),
            serde_json::json!({"id": "c1", "created": 1, "model": "m", "choices": [
                {"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}
            ]}),
        ];
        let body = chunks
            .iter()
            .map(|chunk| format!("data: {chunk}\n\n"))
            .chain(core::iter::once("data: [DONE]\n\n".to_owned()))
            .collect::<String>();
        let safeguard = upstream("application/json", verdict("safe"), Reply::Now).await;
        let backend = upstream("text/event-stream", body, Reply::Now).await;
        let (service, _) = service(&backend.base_url, &safeguard.base_url, &[]);

        let request = Request::new(ChatCompletionStreamRequest {
            request_id: "req-4".to_owned(),
            messages: vec![ChatMessage {
                role: "user".to_owned(),
                content: "greet me".to_owned(),
            }],
            ..Default::default()
        });
        let stream = service.chat_completion_stream(request).await.unwrap().into_inner();
        let items = drain(stream).await;

        let contents: Vec<String> = items
            .iter()
            .map(|item| {
                let chunk = item.as_ref().unwrap();
                chunk.choices[0].delta.as_ref().unwrap().content.clone().unwrap()
            })
            .collect();
        assert_eq!(contents, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_unavailable() {
        let (service, lifecycle) = service("http://127.0.0.1:9", "http://127.0.0.1:9", &[]);
        lifecycle.shutdown(Duration::ZERO).await;

        let Err(status) = service.generate_stream(generate("req-5", "hello")).await else {
            panic!("stream admitted during shutdown");
        };
        assert_eq!(status.code(), Code::Unavailable);
        assert!(status.message().starts_with("Request ID: req-5 | Error Msg:"));
        assert_eq!(lifecycle.inflight(), 0);
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected() {
        let (service, lifecycle) = service("http://127.0.0.1:9", "http://127.0.0.1:9", &[]);

        let Err(status) = service.generate_stream(generate("req-6", "  ")).await else {
            panic!("blank prompt admitted");
        };
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(lifecycle.inflight(), 0);
    }

    #[test]
    fn rejections_name_the_request() {
        let status = reject(
            "req-7",
            &Error::InvalidRequest {
                reason: "messages must not be empty".to_owned(),
            },
        );
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().starts_with("Request ID: req-7 | Error Msg:"));
    }

    #[test]
    fn clock_is_past_the_epoch() {
        assert!(unix_now() > 1_600_000_000);
    }
}
