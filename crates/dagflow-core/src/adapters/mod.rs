//! Narrow interfaces to the external collaborators this crate does not own
//! (§1: LLM provider HTTP clients, the embedded scripting runtime, the
//! filesystem, generic HTTP). Handlers depend only on these traits, the
//! same separation the teacher draws between `workflow::engine`'s
//! `NodeExecutor` trait and its `SimulatedExecutor` stand-in: handler logic
//! stays pure and testable against a fake, while a real deployment wires in
//! the adapters below.

mod error;
mod types;

pub use error::AdapterError;
pub use types::{AuthKind, FileFormat, HttpRequest, HttpResponse, WriteInfo};

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::watch;

pub type CancelSignal = watch::Receiver<bool>;

pub fn is_cancelled(cancel: &CancelSignal) -> bool {
    *cancel.borrow()
}

#[async_trait::async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        schema: Option<&JsonValue>,
        cancel: &CancelSignal,
    ) -> Result<JsonValue, AdapterError>;
}

#[async_trait::async_trait]
pub trait HttpAdapter: Send + Sync {
    async fn request(
        &self,
        req: HttpRequest,
        cancel: &CancelSignal,
    ) -> Result<HttpResponse, AdapterError>;
}

#[async_trait::async_trait]
pub trait FilesystemAdapter: Send + Sync {
    async fn read(
        &self,
        path: &str,
        format: FileFormat,
        cancel: &CancelSignal,
    ) -> Result<JsonValue, AdapterError>;

    async fn write(
        &self,
        path: &str,
        format: FileFormat,
        content: &JsonValue,
        cancel: &CancelSignal,
    ) -> Result<WriteInfo, AdapterError>;

    async fn glob(&self, pattern: &str) -> Result<Vec<String>, AdapterError>;
}

#[async_trait::async_trait]
pub trait ScriptAdapter: Send + Sync {
    async fn eval(
        &self,
        code_or_file: &str,
        context: &JsonValue,
        cancel: &CancelSignal,
    ) -> Result<JsonValue, AdapterError>;
}

/// `LlmAdapter` with no provider wired in. LLM provider HTTP clients are
/// explicitly out of this crate's scope (§1); embedders supply their own
/// implementation. Calling this one is a configuration error, not a
/// transport failure.
pub struct UnconfiguredLlmAdapter;

#[async_trait::async_trait]
impl LlmAdapter for UnconfiguredLlmAdapter {
    async fn complete(
        &self,
        _model: &str,
        _prompt: &str,
        _schema: Option<&JsonValue>,
        _cancel: &CancelSignal,
    ) -> Result<JsonValue, AdapterError> {
        Err(AdapterError::Transport(
            "no LlmAdapter configured; this crate ships only the interface (§1)".to_string(),
        ))
    }
}

/// Default `HttpAdapter` backed by `reqwest`.
pub struct ReqwestHttpAdapter {
    client: reqwest::Client,
}

impl Default for ReqwestHttpAdapter {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait::async_trait]
impl HttpAdapter for ReqwestHttpAdapter {
    async fn request(
        &self,
        req: HttpRequest,
        cancel: &CancelSignal,
    ) -> Result<HttpResponse, AdapterError> {
        if is_cancelled(cancel) {
            return Err(AdapterError::Cancelled);
        }

        let method = req
            .method
            .parse::<reqwest::Method>()
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        let mut builder = self.client.request(method, &req.url);
        for (k, v) in &req.headers {
            builder = builder.header(k, v);
        }
        if !req.params.is_empty() {
            builder = builder.query(&req.params);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        builder = match req.auth {
            // Both schemes expect the caller to have rendered a complete
            // `Authorization` header value into `headers` (§6: credential
            // lookup against `env.*` is the handler's config-rendering
            // concern, not this adapter's); this only re-asserts it wins
            // over whatever `.header()` loop above already set.
            AuthKind::Bearer | AuthKind::Basic => {
                if let Some(token) = req.headers.get("Authorization") {
                    builder.header("Authorization", token)
                } else {
                    builder
                }
            }
            AuthKind::None => builder,
        };
        if let Some(secs) = req.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::TimedOut { seconds: req.timeout_seconds.unwrap_or(0) }
            } else {
                AdapterError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let text = response
            .text()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        let body = if content_type.contains("json") {
            serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
        } else {
            JsonValue::String(text)
        };

        if status >= 400 {
            return Err(AdapterError::HttpStatus { status, body: body.to_string() });
        }

        Ok(HttpResponse { status, headers, body })
    }
}

/// Default `FilesystemAdapter` backed by `tokio::fs` and `glob`.
#[derive(Default)]
pub struct TokioFilesystemAdapter;

#[async_trait::async_trait]
impl FilesystemAdapter for TokioFilesystemAdapter {
    async fn read(
        &self,
        path: &str,
        format: FileFormat,
        cancel: &CancelSignal,
    ) -> Result<JsonValue, AdapterError> {
        if is_cancelled(cancel) {
            return Err(AdapterError::Cancelled);
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AdapterError::Filesystem(format!("{path}: {e}")))?;

        match format {
            FileFormat::Json => {
                serde_json::from_slice(&bytes).map_err(|e| AdapterError::Filesystem(e.to_string()))
            }
            FileFormat::Yaml => {
                serde_yaml::from_slice(&bytes).map_err(|e| AdapterError::Filesystem(e.to_string()))
            }
            FileFormat::Text => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| AdapterError::Filesystem(e.to_string()))?;
                Ok(JsonValue::String(text))
            }
            FileFormat::Bytes => {
                use base64::Engine;
                Ok(JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes)))
            }
        }
    }

    async fn write(
        &self,
        path: &str,
        format: FileFormat,
        content: &JsonValue,
        cancel: &CancelSignal,
    ) -> Result<WriteInfo, AdapterError> {
        if is_cancelled(cancel) {
            return Err(AdapterError::Cancelled);
        }

        let bytes: Vec<u8> = match format {
            FileFormat::Json => {
                serde_json::to_vec_pretty(content).map_err(|e| AdapterError::Filesystem(e.to_string()))?
            }
            FileFormat::Yaml => {
                serde_yaml::to_string(content)
                    .map_err(|e| AdapterError::Filesystem(e.to_string()))?
                    .into_bytes()
            }
            FileFormat::Text => crate::template::stringify(content).into_bytes(),
            FileFormat::Bytes => {
                use base64::Engine;
                let text = content.as_str().unwrap_or_default();
                base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map_err(|e| AdapterError::Filesystem(e.to_string()))?
            }
        };

        if let Some(parent) = PathBuf::from(path).parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        tokio::fs::write(path, &bytes)
            .await
            .map_err(|e| AdapterError::Filesystem(format!("{path}: {e}")))?;

        Ok(WriteInfo { path: path.to_string(), bytes_written: bytes.len() })
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>, AdapterError> {
        let paths = glob::glob(pattern).map_err(|e| AdapterError::Filesystem(e.to_string()))?;
        let mut out = Vec::new();
        for entry in paths {
            match entry {
                Ok(p) => out.push(p.display().to_string()),
                Err(e) => return Err(AdapterError::Filesystem(e.to_string())),
            }
        }
        Ok(out)
    }
}

/// Default `ScriptAdapter`: shells out to an interpreter (default `python3`,
/// overridable via `config::AdaptersConfig::script_interpreter`), the same
/// spawn-and-capture-output shape as the teacher's process supervision in
/// `supervisor.rs`, minus the long-lived streaming (a script node runs to
/// completion and returns one JSON value).
pub struct ProcessScriptAdapter {
    interpreter: String,
}

impl ProcessScriptAdapter {
    pub fn new(interpreter: Option<String>) -> Self {
        Self {
            interpreter: interpreter.unwrap_or_else(|| "python3".to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ScriptAdapter for ProcessScriptAdapter {
    async fn eval(
        &self,
        code_or_file: &str,
        context: &JsonValue,
        cancel: &CancelSignal,
    ) -> Result<JsonValue, AdapterError> {
        if is_cancelled(cancel) {
            return Err(AdapterError::Cancelled);
        }

        let code = if PathBuf::from(code_or_file).is_file() {
            tokio::fs::read_to_string(code_or_file)
                .await
                .map_err(|e| AdapterError::Script(e.to_string()))?
        } else {
            code_or_file.to_string()
        };

        // Wrap the user's script so its last expression is serialized as
        // the node's output: the script host "expects JSON-serializable
        // return" (§4.4), surfaced here via stdout.
        let wrapper = format!(
            "import json, sys\ncontext = json.loads('''{}''')\n{}\n",
            serde_json::to_string(context).unwrap_or_default().replace('\'', "\\'"),
            code
        );

        let output = tokio::process::Command::new(&self.interpreter)
            .arg("-c")
            .arg(&wrapper)
            .output()
            .await
            .map_err(|e| AdapterError::Script(format!("spawn failed: {e}")))?;

        if !output.status.success() {
            return Err(AdapterError::Script(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(trimmed)
            .map_err(|_| AdapterError::NotSerializable(trimmed.to_string()))
    }
}

/// Deterministic in-memory adapters for handler unit tests, mirroring the
/// teacher's `SimulatedExecutor`.
pub mod simulated {
    use super::*;
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct SimulatedLlmAdapter {
        pub fixed_response: Option<JsonValue>,
    }

    #[async_trait::async_trait]
    impl LlmAdapter for SimulatedLlmAdapter {
        async fn complete(
            &self,
            model: &str,
            prompt: &str,
            _schema: Option<&JsonValue>,
            _cancel: &CancelSignal,
        ) -> Result<JsonValue, AdapterError> {
            Ok(self
                .fixed_response
                .clone()
                .unwrap_or_else(|| JsonValue::String(format!("simulated completion for {model}: {prompt}"))))
        }
    }

    #[derive(Default)]
    pub struct SimulatedHttpAdapter {
        pub responses: Mutex<Map<String, HttpResponse>>,
    }

    #[async_trait::async_trait]
    impl HttpAdapter for SimulatedHttpAdapter {
        async fn request(
            &self,
            req: HttpRequest,
            _cancel: &CancelSignal,
        ) -> Result<HttpResponse, AdapterError> {
            self.responses
                .lock()
                .unwrap()
                .get(&req.url)
                .cloned()
                .ok_or_else(|| AdapterError::Transport(format!("no simulated response for {}", req.url)))
        }
    }
}
