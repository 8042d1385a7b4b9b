//! Access logging
//!
//! Each listener builds an [`AccessLogger`] from its access log settings.
//! File sinks render Envoy command operators (`%RESPONSE_CODE%`,
//! `%REQ(USER-AGENT)%`, ...) as text or JSON. Streaming sinks batch
//! structured entries and post them to the access-log service as NDJSON.

use crate::dlp::DlpMasker;
use crate::error::ProxyError;
use crate::health_check::HEALTH_CHECK_USER_AGENT;
use crate::metrics::ndjson_frames;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use edge_api::v1::options::access_log::{AccessLogFilter, FileSink, StreamingSink};
use edge_api::v1::options::{AccessLog, AccessLogOutput, FileFormat};
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::{debug, warn};

pub const ACCESS_LOGS_PATH: &str = "/v1/access-logs";
pub const LOG_NAME_HEADER: &str = "x-log-name";

pub const DEFAULT_FORMAT: &str = "[%START_TIME%] \"%REQ(:METHOD)% %REQ(X-ENVOY-ORIGINAL-PATH?:PATH)% %PROTOCOL%\" %RESPONSE_CODE% %RESPONSE_FLAGS% %BYTES_RECEIVED% %BYTES_SENT% %DURATION% %RESP(X-ENVOY-UPSTREAM-SERVICE-TIME)% \"%REQ(X-FORWARDED-FOR)%\" \"%REQ(USER-AGENT)%\" \"%REQ(X-REQUEST-ID)%\" \"%REQ(:AUTHORITY)%\" \"%UPSTREAM_HOST%\"\n";

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 10_000;

/// One completed request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub start_time: DateTime<Utc>,
    pub method: String,
    /// Path including the query string
    pub path: String,
    pub protocol: String,
    pub authority: String,
    pub response_code: u16,
    pub response_flags: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_cluster: Option<String>,
    pub downstream_remote_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_name: Option<String>,
    /// Lowercased names
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
}

impl AccessLogEntry {
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Copy with the path and header values masked
    pub fn masked(&self, dlp: &DlpMasker) -> Self {
        let mask_map = |map: &BTreeMap<String, String>| {
            map.iter()
                .map(|(k, v)| (k.clone(), dlp.mask(v).into_owned()))
                .collect()
        };
        Self {
            path: dlp.mask(&self.path).into_owned(),
            request_headers: mask_map(&self.request_headers),
            response_headers: mask_map(&self.response_headers),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Operator {
    Req {
        name: String,
        fallback: Option<String>,
        strip_query: bool,
    },
    Resp(String),
    Protocol,
    ResponseCode,
    ResponseFlags,
    BytesReceived,
    BytesSent,
    Duration,
    StartTime,
    UpstreamHost,
    UpstreamCluster,
    DownstreamRemoteAddress,
    RouteName,
}

impl Operator {
    fn is_numeric(&self) -> bool {
        matches!(
            self,
            Operator::ResponseCode | Operator::BytesReceived | Operator::BytesSent | Operator::Duration
        )
    }

    fn render(&self, entry: &AccessLogEntry) -> Option<String> {
        match self {
            Operator::Req {
                name,
                fallback,
                strip_query,
            } => {
                let value = request_value(entry, name)
                    .or_else(|| fallback.as_deref().and_then(|f| request_value(entry, f)))?;
                if *strip_query {
                    Some(value.split('?').next().unwrap_or_default().to_string())
                } else {
                    Some(value)
                }
            }
            Operator::Resp(name) => entry.response_header(name).map(str::to_string),
            Operator::Protocol => Some(entry.protocol.clone()).filter(|p| !p.is_empty()),
            Operator::ResponseCode => Some(entry.response_code.to_string()),
            Operator::ResponseFlags => Some(entry.response_flags.clone()).filter(|f| !f.is_empty()),
            Operator::BytesReceived => Some(entry.bytes_received.to_string()),
            Operator::BytesSent => Some(entry.bytes_sent.to_string()),
            Operator::Duration => Some(entry.duration_ms.to_string()),
            Operator::StartTime => Some(entry.start_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Operator::UpstreamHost => entry.upstream_host.clone(),
            Operator::UpstreamCluster => entry.upstream_cluster.clone(),
            Operator::DownstreamRemoteAddress => Some(entry.downstream_remote_address.clone()),
            Operator::RouteName => entry.route_name.clone(),
        }
    }
}

fn request_value(entry: &AccessLogEntry, name: &str) -> Option<String> {
    match name.to_ascii_lowercase().as_str() {
        ":method" => Some(entry.method.clone()),
        ":path" => Some(entry.path.clone()),
        ":authority" => Some(entry.authority.clone()),
        other => entry.request_header(other).map(str::to_string),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Literal(String),
    Operator { op: Operator, max_len: Option<usize> },
}

/// Compiled format string
#[derive(Clone, Debug, PartialEq)]
pub struct AccessLogFormatter {
    tokens: Vec<Token>,
}

impl AccessLogFormatter {
    pub fn parse(format: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut rest = format;

        while let Some(start) = rest.find('%') {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after
                .find('%')
                .ok_or_else(|| invalid_format(format, "unterminated command operator"))?;
            let command = &after[..end];
            rest = &after[end + 1..];

            if command.is_empty() {
                literal.push('%');
                continue;
            }
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            tokens.push(parse_command(format, command)?);
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        Ok(Self { tokens })
    }

    pub fn format(&self, entry: &AccessLogEntry) -> String {
        let mut line = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => line.push_str(text),
                Token::Operator { op, max_len } => {
                    line.push_str(&render_limited(op, *max_len, entry).unwrap_or_else(|| "-".into()))
                }
            }
        }
        line
    }

    /// JSON rendering of a value: numbers stay numbers and a lone missing
    /// operator becomes null
    fn format_json(&self, entry: &AccessLogEntry) -> Value {
        if let [Token::Operator { op, max_len }] = self.tokens.as_slice() {
            return match render_limited(op, *max_len, entry) {
                None => Value::Null,
                Some(value) if op.is_numeric() => value
                    .parse::<u64>()
                    .map(Value::from)
                    .unwrap_or(Value::String(value)),
                Some(value) => Value::String(value),
            };
        }
        Value::String(self.format(entry))
    }
}

fn render_limited(op: &Operator, max_len: Option<usize>, entry: &AccessLogEntry) -> Option<String> {
    let value = op.render(entry)?;
    Some(match max_len {
        Some(max) => value.chars().take(max).collect(),
        None => value,
    })
}

fn invalid_format(format: &str, reason: &str) -> ProxyError {
    ProxyError::InvalidConfiguration(format!("access log format {:?}: {}", format, reason))
}

fn parse_command(format: &str, command: &str) -> Result<Token> {
    // NAME, NAME(ARG) or NAME(ARG):MAX
    let (head, max_len) = match command.rsplit_once(':') {
        Some((head, max)) if head.ends_with(')') => {
            let max = max
                .parse::<usize>()
                .map_err(|_| invalid_format(format, "invalid max length"))?;
            (head, Some(max))
        }
        _ => (command, None),
    };
    let (name, arg) = match head.find('(') {
        Some(open) if head.ends_with(')') => (&head[..open], Some(&head[open + 1..head.len() - 1])),
        Some(_) => return Err(invalid_format(format, "unbalanced parenthesis")),
        None => (head, None),
    };

    let header_arg = || -> Result<(String, Option<String>)> {
        let arg = arg
            .filter(|a| !a.is_empty())
            .ok_or_else(|| invalid_format(format, &format!("{} needs a header name", name)))?;
        Ok(match arg.split_once('?') {
            Some((primary, fallback)) => (primary.to_string(), Some(fallback.to_string())),
            None => (arg.to_string(), None),
        })
    };

    let op = match name {
        "REQ" | "REQ_WITHOUT_QUERY" => {
            let (name_arg, fallback) = header_arg()?;
            Operator::Req {
                name: name_arg,
                fallback,
                strip_query: name == "REQ_WITHOUT_QUERY",
            }
        }
        "RESP" => Operator::Resp(header_arg()?.0),
        "PROTOCOL" => Operator::Protocol,
        "RESPONSE_CODE" => Operator::ResponseCode,
        "RESPONSE_FLAGS" => Operator::ResponseFlags,
        "BYTES_RECEIVED" => Operator::BytesReceived,
        "BYTES_SENT" => Operator::BytesSent,
        "DURATION" => Operator::Duration,
        "START_TIME" => Operator::StartTime,
        "UPSTREAM_HOST" => Operator::UpstreamHost,
        "UPSTREAM_CLUSTER" => Operator::UpstreamCluster,
        "DOWNSTREAM_REMOTE_ADDRESS" => Operator::DownstreamRemoteAddress,
        "ROUTE_NAME" => Operator::RouteName,
        other => {
            return Err(invalid_format(
                format,
                &format!("unknown command operator {}", other),
            ))
        }
    };
    Ok(Token::Operator { op, max_len })
}

pub fn filter_accepts(filter: &AccessLogFilter, entry: &AccessLogEntry) -> bool {
    if let Some(min) = filter.status_code_min {
        if entry.response_code < min {
            return false;
        }
    }
    if filter.not_health_check && entry.request_header("user-agent") == Some(HEALTH_CHECK_USER_AGENT) {
        return false;
    }
    true
}

enum FileFormatter {
    Text(AccessLogFormatter),
    Json(BTreeMap<String, AccessLogFormatter>),
}

impl FileFormatter {
    fn new(format: Option<&FileFormat>) -> Result<Self> {
        Ok(match format {
            None => FileFormatter::Text(AccessLogFormatter::parse(DEFAULT_FORMAT)?),
            Some(FileFormat::StringFormat(format)) => {
                let mut format = format.clone();
                if !format.ends_with('\n') {
                    format.push('\n');
                }
                FileFormatter::Text(AccessLogFormatter::parse(&format)?)
            }
            Some(FileFormat::JsonFormat(fields)) => FileFormatter::Json(
                fields
                    .iter()
                    .map(|(key, format)| Ok((key.clone(), AccessLogFormatter::parse(format)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    fn render(&self, entry: &AccessLogEntry) -> String {
        match self {
            FileFormatter::Text(formatter) => formatter.format(entry),
            FileFormatter::Json(fields) => {
                let object: Map<String, Value> = fields
                    .iter()
                    .map(|(key, formatter)| (key.clone(), formatter.format_json(entry)))
                    .collect();
                let mut line = Value::Object(object).to_string();
                line.push('\n');
                line
            }
        }
    }
}

enum FileTarget {
    Stdout,
    Stderr,
    Path {
        path: String,
        file: OnceCell<Mutex<tokio::fs::File>>,
    },
}

impl FileTarget {
    fn new(path: &str) -> Self {
        match path {
            "/dev/stdout" => FileTarget::Stdout,
            "/dev/stderr" => FileTarget::Stderr,
            _ => FileTarget::Path {
                path: path.to_string(),
                file: OnceCell::new(),
            },
        }
    }

    async fn write(&self, line: &str) -> std::io::Result<()> {
        match self {
            FileTarget::Stdout => tokio::io::stdout().write_all(line.as_bytes()).await,
            FileTarget::Stderr => tokio::io::stderr().write_all(line.as_bytes()).await,
            FileTarget::Path { path, file } => {
                let file = file
                    .get_or_try_init(|| async {
                        tokio::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(path)
                            .await
                            .map(Mutex::new)
                    })
                    .await?;
                file.lock().await.write_all(line.as_bytes()).await
            }
        }
    }
}

/// Batches entries and posts them to the access-log service
#[derive(Clone)]
pub struct AccessLogStreamer {
    tx: mpsc::Sender<AccessLogEntry>,
}

impl AccessLogStreamer {
    /// Spawn the delivery task. It flushes and exits once every handle is
    /// dropped. Must be called within a tokio runtime.
    pub fn start(endpoint: &str, log_name: &str) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let url = format!("{}{}", endpoint.trim_end_matches('/'), ACCESS_LOGS_PATH);
        tokio::spawn(deliver(rx, url, log_name.to_string()));
        Self { tx }
    }

    pub fn send(&self, entry: AccessLogEntry) {
        if self.tx.try_send(entry).is_err() {
            debug!("Access log stream is full, dropping entry");
        }
    }
}

async fn deliver(mut rx: mpsc::Receiver<AccessLogEntry>, url: String, log_name: String) {
    let client = reqwest::Client::new();
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let (closed, tick) = tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => {
                    batch.push(entry);
                    (false, false)
                }
                None => (true, false),
            },
            _ = ticker.tick() => (false, true),
        };

        if !batch.is_empty() && (closed || tick || batch.len() >= BATCH_SIZE) {
            let entries = std::mem::take(&mut batch);
            if let Err(e) = post_batch(&client, &url, &log_name, &entries).await {
                warn!(log_name = %log_name, entries = entries.len(), error = %e, "Failed to stream access logs");
            }
        }
        if closed {
            return;
        }
    }
}

async fn post_batch(
    client: &reqwest::Client,
    url: &str,
    log_name: &str,
    entries: &[AccessLogEntry],
) -> anyhow::Result<()> {
    let frames = ndjson_frames(entries);
    let body = reqwest::Body::wrap_stream(stream::iter(
        frames.into_iter().map(Ok::<_, std::io::Error>),
    ));
    client
        .post(url)
        .header(LOG_NAME_HEADER, log_name)
        .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    debug!(log_name = %log_name, entries = entries.len(), "Streamed access logs");
    Ok(())
}

enum SinkKind {
    File { target: FileTarget, formatter: FileFormatter },
    Stream(AccessLogStreamer),
}

struct Sink {
    kind: SinkKind,
    filter: Option<AccessLogFilter>,
}

/// All access log sinks of one listener
#[derive(Clone, Default)]
pub struct AccessLogger {
    sinks: Arc<Vec<Sink>>,
}

impl AccessLogger {
    /// `default_endpoint` serves streaming sinks that name no endpoint
    pub fn new(configs: &[AccessLog], default_endpoint: Option<&str>) -> Result<Self> {
        let mut sinks = Vec::with_capacity(configs.len());
        for config in configs {
            let kind = match &config.output {
                AccessLogOutput::File(FileSink { path, format }) => SinkKind::File {
                    target: FileTarget::new(path),
                    formatter: FileFormatter::new(format.as_ref())?,
                },
                AccessLogOutput::Streaming(StreamingSink { log_name, endpoint }) => {
                    match endpoint.as_deref().or(default_endpoint) {
                        Some(endpoint) => SinkKind::Stream(AccessLogStreamer::start(endpoint, log_name)),
                        None => {
                            warn!(log_name = %log_name, "No access-log service configured, skipping sink");
                            continue;
                        }
                    }
                }
            };
            sinks.push(Sink {
                kind,
                filter: config.filter.clone(),
            });
        }
        Ok(Self {
            sinks: Arc::new(sinks),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write an entry to every sink whose filter accepts it
    pub async fn log(&self, entry: &AccessLogEntry, dlp: Option<&DlpMasker>) {
        if self.sinks.is_empty() {
            return;
        }
        let masked;
        let entry = match dlp.filter(|d| d.applies_to_access_logs()) {
            Some(dlp) => {
                masked = entry.masked(dlp);
                &masked
            }
            None => entry,
        };

        for sink in self.sinks.iter() {
            if let Some(filter) = &sink.filter {
                if !filter_accepts(filter, entry) {
                    continue;
                }
            }
            match &sink.kind {
                SinkKind::File { target, formatter } => {
                    if let Err(e) = target.write(&formatter.render(entry)).await {
                        warn!(error = %e, "Failed to write access log");
                    }
                }
                SinkKind::Stream(streamer) => streamer.send(entry.clone()),
            }
        }
    }
}
