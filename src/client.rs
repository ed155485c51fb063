//! Caller side of the HTTP contract, used by the `link`, `send` and
//! `status` subcommands.

use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;
use wasend_core::{
    dispatch::DispatchReport,
    error::{ErrorKind, WasendError},
    link::{LinkAck, LinkSnapshot},
};

/// A bulk send that has passed the caller-side checks.
///
/// Construction fails with `InvalidInput` for an empty message or a missing
/// or empty file, so no request is ever made for them.
#[derive(Debug)]
pub struct DispatchRequest {
    message: String,
    file_name: String,
    file: Vec<u8>,
}

impl DispatchRequest {
    pub fn new(message: &str, file: Option<&Path>) -> Result<Self, WasendError> {
        if message.trim().is_empty() {
            return Err(WasendError::InvalidInput("message is required".into()));
        }
        let path = file.ok_or_else(|| WasendError::InvalidInput("file is required".into()))?;
        let bytes = std::fs::read(path).map_err(|e| {
            WasendError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?;
        if bytes.is_empty() {
            return Err(WasendError::InvalidInput(format!(
                "{} is empty",
                path.display()
            )));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recipients.xlsx".to_string());

        Ok(Self {
            message: message.to_string(),
            file_name,
            file: bytes,
        })
    }
}

/// Successful `/send-messages` response.
#[derive(Debug, Deserialize)]
pub struct SendOutcome {
    pub message: String,
    pub report: DispatchReport,
}

#[derive(Deserialize)]
struct RemoteError {
    error: String,
    kind: Option<ErrorKind>,
    report: Option<DispatchReport>,
}

/// HTTP client for a wasend server.
pub struct ApiClient {
    base_url: String,
    session: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, session: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session: session.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!("wasend client: {method} {url} session={}", self.session);
        let builder = self
            .http
            .request(method, url)
            .query(&[("session", &self.session)]);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, WasendError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| WasendError::Request(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| WasendError::Request(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(remote_error(status.as_u16(), &body));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// `GET /link-device`.
    pub async fn link_device(&self) -> Result<LinkAck, WasendError> {
        self.execute(self.request(reqwest::Method::GET, "/link-device"))
            .await
    }

    /// `POST /unlink-device`.
    pub async fn unlink(&self) -> Result<LinkAck, WasendError> {
        self.execute(self.request(reqwest::Method::POST, "/unlink-device"))
            .await
    }

    /// `GET /state`.
    pub async fn state(&self) -> Result<LinkSnapshot, WasendError> {
        self.execute(self.request(reqwest::Method::GET, "/state"))
            .await
    }

    /// `POST /send-messages`.
    pub async fn send_messages(&self, req: DispatchRequest) -> Result<SendOutcome, WasendError> {
        let part = Part::bytes(req.file)
            .file_name(req.file_name)
            .mime_str("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
            .map_err(|e| WasendError::Request(e.to_string()))?;
        let form = Form::new().text("message", req.message).part("file", part);

        self.execute(
            self.request(reqwest::Method::POST, "/send-messages")
                .multipart(form),
        )
        .await
    }
}

/// Rebuild a `WasendError` from a non-2xx response body.
fn remote_error(status: u16, body: &[u8]) -> WasendError {
    let Ok(remote) = serde_json::from_slice::<RemoteError>(body) else {
        let text = String::from_utf8_lossy(body);
        return WasendError::Request(format!("server returned {status}: {text}"));
    };

    let message = remote.error;
    match remote.kind {
        Some(ErrorKind::InvalidInput) => WasendError::InvalidInput(message),
        Some(ErrorKind::NotLinked) => WasendError::NotLinked,
        Some(ErrorKind::DispatchBusy) => WasendError::DispatchBusy,
        Some(ErrorKind::NotFound) => WasendError::NotFound(message),
        Some(ErrorKind::MalformedSpreadsheet) => WasendError::Spreadsheet(
            strip_prefix(&message, "malformed spreadsheet: "),
        ),
        Some(ErrorKind::LinkFailed) => {
            WasendError::Link(strip_prefix(&message, "link error: "))
        }
        Some(ErrorKind::SendFailed) => match remote.report {
            Some(report) => WasendError::SendFailed {
                message,
                report: Box::new(report),
            },
            None => WasendError::Device(message),
        },
        _ => WasendError::Request(format!("server returned {status}: {message}")),
    }
}

fn strip_prefix(message: &str, prefix: &str) -> String {
    message.strip_prefix(prefix).unwrap_or(message).to_string()
}
