//! Purpose: Provide an HTTP/JSON client for a directory service.
//! Exports: `RemoteDirectory`.
//! Role: Production `Directory` implementation used by the CLI.
//! Invariants: Unary calls are JSON envelopes; export and import bodies are JSONL, one item per line.
//! Invariants: HTTP status maps onto `ErrorKind`; transport failures are `ErrorKind::Io`.
//! Invariants: Streaming calls run on a dedicated thread and never block the async runtime.
//! Invariants: Import acknowledgements are read after the request body is complete (HTTP/1.1).
//! Invariants: An aborted import fails the body mid-stream; the chunked terminator is never sent.
#![allow(clippy::result_large_err)]

use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::directory::{
    Directory, ExportMessage, ExportOptions, ExportStream, ImportAbort, ImportAck, ImportRequest,
    ImportStream, Page, PageRequest, STREAM_BUFFER,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{ObjectType, Permission, RelationType};

type ApiResult<T> = Result<T, Error>;

const API_PREFIX: [&str; 2] = ["api", "v1"];

#[derive(Clone)]
pub struct RemoteDirectory {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    base_url: Url,
    token: Option<String>,
    timeout: Option<Duration>,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct ResultEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct ListEnvelope<T> {
    results: Vec<T>,
    #[serde(default)]
    page: PageInfo,
}

#[derive(Deserialize, Default)]
struct PageInfo {
    #[serde(default)]
    next_token: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
}

#[derive(Serialize)]
struct SetObjectTypeRequest<'a> {
    object_type: &'a ObjectType,
}

#[derive(Serialize)]
struct SetPermissionRequest<'a> {
    permission: &'a Permission,
}

#[derive(Serialize)]
struct SetRelationTypeRequest<'a> {
    relation_type: &'a RelationType,
}

impl RemoteDirectory {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new().build();
        Ok(Self {
            inner: Arc::new(RemoteInner {
                base_url,
                token: None,
                timeout: None,
                agent,
            }),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = Some(token.into());
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.token = token;
        } else {
            self.inner = Arc::new(RemoteInner {
                base_url: self.inner.base_url.clone(),
                token,
                timeout: self.inner.timeout,
                agent: self.inner.agent.clone(),
            });
        }
        self
    }

    /// Bound connection setup and each unary call; streams are bounded only on connect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout_connect(timeout).build();
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.timeout = Some(timeout);
            inner.agent = agent;
        } else {
            self.inner = Arc::new(RemoteInner {
                base_url: self.inner.base_url.clone(),
                token: self.inner.token.clone(),
                timeout: Some(timeout),
                agent,
            });
        }
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn url(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut all: Vec<&str> = API_PREFIX.to_vec();
        all.extend_from_slice(segments);
        build_url(&self.inner.base_url, &all)
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut request = self.inner.agent.request(method, url.as_str());
        if let Some(token) = &self.inner.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        request
    }

    fn get_json<R>(&self, url: &Url) -> ApiResult<R>
    where
        R: DeserializeOwned,
    {
        let mut request = self.request("GET", url).set("Accept", "application/json");
        if let Some(timeout) = self.inner.timeout {
            request = request.timeout(timeout);
        }
        finish_request(request.call()).and_then(read_json_response)
    }

    fn post_json<T, R>(&self, url: &Url, body: &T) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_string(body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;
        let mut request = self
            .request("POST", url)
            .set("Accept", "application/json")
            .set("Content-Type", "application/json");
        if let Some(timeout) = self.inner.timeout {
            request = request.timeout(timeout);
        }
        finish_request(request.send_string(&payload)).and_then(read_json_response)
    }

    fn list<T>(&self, url: Url, page: &PageRequest) -> ApiResult<Page<T>>
    where
        T: DeserializeOwned,
    {
        let mut url = url;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("page.size", &page.size.to_string());
            if !page.token.is_empty() {
                query.append_pair("page.token", &page.token);
            }
        }
        let envelope: ListEnvelope<T> = self.get_json(&url)?;
        Ok(Page {
            results: envelope.results,
            next_token: envelope.page.next_token,
        })
    }
}

impl Directory for RemoteDirectory {
    fn get_object_type(&self, name: &str) -> ApiResult<ObjectType> {
        let url = self.url(&["object_types", name])?;
        let envelope: ResultEnvelope<ObjectType> = self.get_json(&url)?;
        Ok(envelope.result)
    }

    fn set_object_type(&self, object_type: ObjectType) -> ApiResult<ObjectType> {
        let url = self.url(&["object_types"])?;
        let envelope: ResultEnvelope<ObjectType> = self.post_json(
            &url,
            &SetObjectTypeRequest {
                object_type: &object_type,
            },
        )?;
        Ok(envelope.result)
    }

    fn get_permission(&self, name: &str) -> ApiResult<Permission> {
        let url = self.url(&["permissions", name])?;
        let envelope: ResultEnvelope<Permission> = self.get_json(&url)?;
        Ok(envelope.result)
    }

    fn set_permission(&self, permission: Permission) -> ApiResult<Permission> {
        let url = self.url(&["permissions"])?;
        let envelope: ResultEnvelope<Permission> = self.post_json(
            &url,
            &SetPermissionRequest {
                permission: &permission,
            },
        )?;
        Ok(envelope.result)
    }

    fn get_relation_type(&self, object_type: &str, name: &str) -> ApiResult<RelationType> {
        let url = self.url(&["object_types", object_type, "relation_types", name])?;
        let envelope: ResultEnvelope<RelationType> = self.get_json(&url)?;
        Ok(envelope.result)
    }

    fn set_relation_type(&self, relation_type: RelationType) -> ApiResult<RelationType> {
        let url = self.url(&["relation_types"])?;
        let envelope: ResultEnvelope<RelationType> = self.post_json(
            &url,
            &SetRelationTypeRequest {
                relation_type: &relation_type,
            },
        )?;
        Ok(envelope.result)
    }

    fn list_object_types(&self, page: &PageRequest) -> ApiResult<Page<ObjectType>> {
        self.list(self.url(&["object_types"])?, page)
    }

    fn list_relation_types(
        &self,
        object_type: &str,
        page: &PageRequest,
    ) -> ApiResult<Page<RelationType>> {
        self.list(
            self.url(&["object_types", object_type, "relation_types"])?,
            page,
        )
    }

    fn export(&self, options: &ExportOptions) -> ApiResult<ExportStream> {
        let mut url = self.url(&["export"])?;
        let kinds: Vec<&str> = options.kinds.iter().map(|kind| kind.root_key()).collect();
        url.query_pairs_mut().append_pair("kinds", &kinds.join(","));
        let request = self
            .request("GET", &url)
            .set("Accept", "application/jsonl");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        spawn_stream_thread("dsmigrate-export", move || {
            let result = finish_request(request.call()).and_then(|response| {
                let mut reader = BufReader::new(response.into_reader());
                while let Some(value) = next_json_line(&mut reader, "export stream")? {
                    let message = ExportMessage::from_value(value);
                    let stop = matches!(&message, Err(err) if !err.is_schema_mismatch());
                    if tx.blocking_send(message).is_err() || stop {
                        break;
                    }
                }
                Ok(())
            });
            if let Err(err) = result {
                let _ = tx.blocking_send(Err(err));
            }
        })?;
        Ok(ExportStream { messages: rx })
    }

    fn import(&self) -> ApiResult<ImportStream> {
        let url = self.url(&["import"])?;
        let request = self
            .request("POST", &url)
            .set("Accept", "application/jsonl")
            .set("Content-Type", "application/jsonl");

        let (request_tx, request_rx) = mpsc::channel::<ImportRequest>(STREAM_BUFFER);
        let (ack_tx, ack_rx) = mpsc::channel(STREAM_BUFFER);
        let abort = ImportAbort::new();
        let body = RequestBody::new(request_rx, abort.clone());
        spawn_stream_thread("dsmigrate-import", move || {
            let result = finish_request(request.send(body)).and_then(|response| {
                let mut reader = BufReader::new(response.into_reader());
                while let Some(value) = next_json_line(&mut reader, "import acknowledgements")? {
                    let ack = decode_ack(value);
                    let stop = ack.is_err();
                    if ack_tx.blocking_send(ack).is_err() || stop {
                        break;
                    }
                }
                Ok(())
            });
            if let Err(err) = result {
                let _ = ack_tx.blocking_send(Err(err));
            }
        })?;
        Ok(ImportStream {
            requests: request_tx,
            acks: ack_rx,
            abort,
        })
    }
}

fn spawn_stream_thread<F>(name: &str, body: F) -> ApiResult<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map(|_| ())
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start stream thread")
                .with_source(err)
        })
}

/// Request body that serializes queued import requests as JSONL until the queue closes.
struct RequestBody {
    requests: mpsc::Receiver<ImportRequest>,
    abort: ImportAbort,
    pending: Vec<u8>,
    offset: usize,
    sent: u64,
}

impl RequestBody {
    fn new(requests: mpsc::Receiver<ImportRequest>, abort: ImportAbort) -> Self {
        Self {
            requests,
            abort,
            pending: Vec::new(),
            offset: 0,
            sent: 0,
        }
    }
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.pending.len() {
            let Some(request) = self.requests.blocking_recv() else {
                if self.abort.is_aborted() {
                    debug!(sent = self.sent, "import request body aborted");
                    return Err(io::Error::other("import cancelled"));
                }
                debug!(sent = self.sent, "import request body complete");
                return Ok(0);
            };
            self.pending.clear();
            self.offset = 0;
            serde_json::to_writer(&mut self.pending, &request).map_err(io::Error::other)?;
            self.pending.push(b'\n');
            self.sent += 1;
        }
        let len = (self.pending.len() - self.offset).min(buf.len());
        buf[..len].copy_from_slice(&self.pending[self.offset..self.offset + len]);
        self.offset += len;
        Ok(len)
    }
}

fn decode_ack(value: Value) -> ApiResult<ImportAck> {
    if value.get("error").is_some() {
        return match serde_json::from_value::<ErrorEnvelope>(value) {
            Ok(envelope) => Err(error_from_remote(envelope.error)),
            Err(err) => Err(Error::new(ErrorKind::Service)
                .with_message("invalid error in import acknowledgements")
                .with_source(err)),
        };
    }
    serde_json::from_value(value).map_err(|err| {
        Error::new(ErrorKind::Service)
            .with_message("invalid import acknowledgement")
            .with_source(err)
    })
}

fn next_json_line(reader: &mut dyn BufRead, what: &str) -> ApiResult<Option<Value>> {
    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to read {what}"))
                .with_source(err)
        })?;
        if bytes == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line).map_err(|err| {
            Error::new(ErrorKind::Service)
                .with_message(format!("invalid json in {what}"))
                .with_source(err)
        })?;
        return Ok(Some(value));
    }
}

fn finish_request(response: Result<ureq::Response, ureq::Error>) -> ApiResult<ureq::Response> {
    match response {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
        Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
            .with_message("request failed")
            .with_source(err)),
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid directory url")
            .with_hint("Use a base url such as http://localhost:9393.")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("directory url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("directory url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("directory url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Service)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("directory error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let kind = parse_error_kind(&remote.kind);
    let mut err = Error::new(kind);
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    err
}

fn parse_error_kind(kind: &str) -> ErrorKind {
    match kind {
        "Usage" => ErrorKind::Usage,
        "NotFound" => ErrorKind::NotFound,
        _ => ErrorKind::Service,
    }
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 => ErrorKind::Usage,
        404 => ErrorKind::NotFound,
        _ => ErrorKind::Service,
    }
}
