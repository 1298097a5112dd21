#![doc = include_str!("../README.md")]

mod server;

use anyhow::Context;
use clap::Parser;
use futures::Stream;
use guardstream_tonic_core::{
    guardstream::{HfTokenizer, RefusalStreamer},
    proto::{FILE_DESCRIPTOR_SET, text_generator_server::TextGeneratorServer},
};
use server::{
    backend::{LlmBackend, SafeguardClient},
    config::{CliArgs, ServerConfig},
    health::BackendProber,
    service::{handler::TextGeneratorService, lifecycle::Lifecycle},
    telemetry::{TelemetryProviders, init_telemetry},
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&uds_path, &config);
            let res = run_server_with_incoming(providers, incoming, config).await;
            // A panic can still leave the socket file behind.
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp_addr = config.server_addr.clone();
        let tcp = TcpListener::bind(&tcp_addr).await?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&tcp_addr, &config);
        run_server_with_incoming(providers, incoming, config).await
    }
}

/// Long-lived collaborators shared by every request.
struct Components {
    service: TextGeneratorService,
    prober: BackendProber,
    lifecycle: Lifecycle,
}

fn build_components(config: &ServerConfig) -> anyhow::Result<Components> {
    let tokenizer = HfTokenizer::from_file(&config.tokenizer_path)
        .with_context(|| format!("failed to load {}", config.tokenizer_path.display()))?;
    let refusal = RefusalStreamer::new(Arc::new(tokenizer));
    let refusal = match &config.refusal_template {
        Some(template) => refusal.with_template(template)?,
        None => refusal,
    };

    let backend = LlmBackend::from_config(config)?;
    let safeguard = SafeguardClient::from_config(config)?;
    tracing::info!(
        backend = ?backend.kind(),
        safeguard = safeguard.url(),
        "backends configured"
    );
    let prober = BackendProber::new(&backend, config.probe_interval);
    let lifecycle = Lifecycle::new();
    let service = TextGeneratorService::new(config, backend, safeguard, refusal, lifecycle.clone());

    Ok(Components {
        service,
        prober,
        lifecycle,
    })
}

async fn run_server_with_incoming<I, IO, IE>(
    providers: TelemetryProviders,
    incoming: I,
    config: ServerConfig,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let Components {
        service,
        prober,
        lifecycle,
    } = build_components(&config)?;

    // Not serving until the prober reaches the backend.
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_not_serving::<TextGeneratorServer<TextGeneratorService>>()
        .await;

    let probe_state = prober.state();
    let prober_cancel = CancellationToken::new();
    let prober_task = tokio::spawn(prober.run(health_reporter.clone(), prober_cancel.clone()));

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_text_generator(service))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(ShutdownPlan {
                lifecycle,
                health_reporter,
                prober_cancel,
                drain_timeout: config.shutdown_timeout,
            }),
        )
        .await?;

    let _ = prober_task.await;
    tracing::info!(
        backend_ready = probe_state.is_ready(),
        last_probe_status = probe_state.last_status(),
        "Service shut down successfully"
    );
    providers.shutdown();
    Ok(())
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting guardstream on {addr} with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting guardstream on {addr} ({:?} backend at {}, safeguard at {})",
            config.backend,
            config.backend_url,
            config.safeguard_url
        );
    }
}

fn build_text_generator(service: TextGeneratorService) -> TextGeneratorServer<TextGeneratorService> {
    TextGeneratorServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

struct ShutdownPlan {
    lifecycle: Lifecycle,
    health_reporter: HealthReporter,
    prober_cancel: CancellationToken,
    drain_timeout: core::time::Duration,
}

async fn shutdown_signal(plan: ShutdownPlan) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // The prober must not flip the status back to SERVING.
    plan.prober_cancel.cancel();
    plan.health_reporter
        .set_not_serving::<TextGeneratorServer<TextGeneratorService>>()
        .await;

    plan.lifecycle.shutdown(plan.drain_timeout).await;
}
