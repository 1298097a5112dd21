use crate::server::backend::{BackendKind, ParamDefaults};
use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use guardstream_tonic_core::guardstream::{HarmCategories, SafeguardWait};
use std::path::PathBuf;

/// Runtime configuration for the `guardstream-tonic-server` binary.
///
/// Every option can be given on the command line or through the environment
/// variable named next to it; a `.env` file in the working directory is
/// loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "guardstream-tonic-server",
    version,
    about = "A gRPC proxy that gates LLM token streams behind a safety classifier"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/guardstream.sock"
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Generation backend flavor: `tgi` or `openai`.
    #[arg(long, env = "BACKEND", default_value_t = String::from("tgi"))]
    pub backend: String,

    /// Base URL of the generation backend, e.g. `http://tgi:8080`.
    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: String,

    /// Base URL of the OpenAI-compatible server hosting the safeguard model.
    #[arg(long, env = "SAFEGUARD_URL")]
    pub safeguard_url: String,

    /// Default headers sent with every backend request, as `name=value`.
    #[arg(long = "header", env = "BACKEND_HEADERS", value_delimiter = ',')]
    pub headers: Vec<String>,

    /// Cookies sent with every backend request, as `name=value`.
    #[arg(long = "cookie", env = "BACKEND_COOKIES", value_delimiter = ',')]
    pub cookies: Vec<String>,

    /// Per-request HTTP timeout towards the backends, in seconds.
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 300)]
    pub http_timeout_secs: u64,

    /// Model name sent to the generation backend.
    #[arg(long, env = "MODEL_ID")]
    pub model_id: Option<String>,

    /// Model name sent to the safeguard server.
    #[arg(long, env = "SAFEGUARD_MODEL_ID")]
    pub safeguard_model_id: Option<String>,

    /// Path to the generation model's `tokenizer.json`, used to tokenize
    /// refusals.
    #[arg(long, env = "TOKENIZER_PATH")]
    pub tokenizer_path: PathBuf,

    /// How long to wait for a verdict once generation has finished, in
    /// seconds.
    #[arg(long, env = "SAFEGUARD_TIMEOUT_SECS", default_value_t = 3)]
    pub safeguard_timeout_secs: u64,

    /// Granularity of the post-generation verdict wait, in milliseconds.
    #[arg(long, env = "SAFEGUARD_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub safeguard_poll_interval_ms: u64,

    /// JSON file mapping harm codes to descriptions. Defaults to the Llama
    /// Guard 3 taxonomy.
    #[arg(long, env = "HARM_CATEGORIES_FILE")]
    pub harm_categories_file: Option<PathBuf>,

    /// Refusal text streamed for unsafe prompts. `{category}` is replaced by
    /// the harm category.
    #[arg(long, env = "REFUSAL_TEMPLATE")]
    pub refusal_template: Option<String>,

    /// Capacity of the response buffer between the orchestrator and the gRPC
    /// stream.
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 32)]
    pub stream_buffer_size: usize,

    /// `max_new_tokens` / `max_tokens` used when a request gives none.
    #[arg(long, env = "DEFAULT_MAX_NEW_TOKENS", default_value_t = 1024)]
    pub default_max_new_tokens: u32,

    /// Temperature used when a request gives none.
    #[arg(long, env = "DEFAULT_TEMPERATURE", default_value_t = 0.7)]
    pub default_temperature: f32,

    /// Instruction markers stripped from generated text.
    #[arg(long, env = "INST_TOKENS", value_delimiter = ',')]
    pub inst_tokens: Vec<String>,

    /// System message prepended to chat requests that carry none.
    #[arg(long, env = "SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,

    /// Interval between backend liveness probes once the backend is up, in
    /// seconds.
    #[arg(long, env = "PROBE_INTERVAL_SECS", default_value_t = 30)]
    pub probe_interval_secs: u64,

    /// How long shutdown waits for in-flight streams to finish, in seconds.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub backend: BackendKind,
    pub backend_url: String,
    pub safeguard_url: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub http_timeout: Duration,
    pub model_id: Option<String>,
    pub safeguard_model_id: Option<String>,
    pub tokenizer_path: PathBuf,
    pub safeguard_wait: SafeguardWait,
    pub harm_categories: HarmCategories,
    pub refusal_template: Option<String>,
    pub stream_buffer_size: usize,
    pub defaults: ParamDefaults,
    pub inst_tokens: Vec<String>,
    pub system_prompt: Option<String>,
    pub probe_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let backend: BackendKind = args.backend.parse()?;

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }
        if args.http_timeout_secs == 0 {
            bail!("HTTP_TIMEOUT_SECS must be greater than 0");
        }
        if args.probe_interval_secs == 0 {
            bail!("PROBE_INTERVAL_SECS must be greater than 0");
        }
        if args.default_max_new_tokens == 0 {
            bail!("DEFAULT_MAX_NEW_TOKENS must be greater than 0");
        }
        if !(args.default_temperature > 0.0) {
            bail!(
                "DEFAULT_TEMPERATURE must be greater than 0 (got {})",
                args.default_temperature
            );
        }

        let safeguard_wait = SafeguardWait::new(
            Duration::from_secs(args.safeguard_timeout_secs),
            Duration::from_millis(args.safeguard_poll_interval_ms),
        )?;

        let harm_categories = match &args.harm_categories_file {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                HarmCategories::from_json_str(&json)?
            }
            None => HarmCategories::default(),
        };

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            backend,
            backend_url: base_url("BACKEND_URL", &args.backend_url)?,
            safeguard_url: base_url("SAFEGUARD_URL", &args.safeguard_url)?,
            headers: key_values("BACKEND_HEADERS", &args.headers)?,
            cookies: key_values("BACKEND_COOKIES", &args.cookies)?,
            http_timeout: Duration::from_secs(args.http_timeout_secs),
            model_id: non_blank(args.model_id),
            safeguard_model_id: non_blank(args.safeguard_model_id),
            tokenizer_path: args.tokenizer_path,
            safeguard_wait,
            harm_categories,
            refusal_template: args.refusal_template,
            stream_buffer_size: args.stream_buffer_size,
            defaults: ParamDefaults {
                max_new_tokens: args.default_max_new_tokens,
                temperature: args.default_temperature,
            },
            inst_tokens: args
                .inst_tokens
                .into_iter()
                .filter(|token| !token.is_empty())
                .collect(),
            system_prompt: non_blank(args.system_prompt),
            probe_interval: Duration::from_secs(args.probe_interval_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

/// Validates an `http(s)` base URL and strips trailing slashes.
fn base_url(name: &str, raw: &str) -> anyhow::Result<String> {
    let url = raw.trim().trim_end_matches('/');
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(url.to_owned()),
        _ => bail!("{name} must be an http(s) URL with a host (got {raw:?})"),
    }
}

/// Parses `name=value` pairs.
fn key_values(name: &str, raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_owned(), value.trim().to_owned()))
            }
            _ => bail!("{name} entries must look like name=value (got {pair:?})"),
        })
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
