//! Daemon Client — authenticated request/response to the language-
//! intelligence daemon.
//!
//! Every request carries an HMAC-SHA-256 signature computed with the
//! daemon's per-session secret, placed in the `X-Ycm-Hmac` header. The
//! client's surface is narrow by design: readiness, project config,
//! completions, diagnostics, navigation, refactors, buffer-lifecycle
//! notifications, and shutdown. Every operation passes file contents
//! in-band, so the daemon has no filesystem dependency of its own.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::DaemonError;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// A 1-based source position, as the daemon's wire protocol expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePosition {
    pub filepath: String,
    pub line_num: u32,
    pub column_num: u32,
    pub file_contents: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefactorRename {
    pub new_name: String,
}

/// HTTP/1.1 + JSON client, HMAC-signed per request.
pub struct DaemonClient {
    http: reqwest::Client,
    base_url: String,
    secret: Vec<u8>,
    timeout: Duration,
}

impl DaemonClient {
    /// `hmac_secret_b64` is the base64-encoded per-session secret
    /// generated by the Supervisor; an empty string marks an externally-
    /// detected, unauthenticated-probe-only session.
    pub fn new(host: &str, port: u16, hmac_secret_b64: &str) -> Result<Self, DaemonError> {
        let secret = if hmac_secret_b64.is_empty() {
            Vec::new()
        } else {
            BASE64
                .decode(hmac_secret_b64)
                .map_err(|e| DaemonError::Hmac(e.to_string()))?
        };
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{host}:{port}"),
            secret,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        !self.secret.is_empty()
    }

    fn sign(&self, method: &str, path: &str, body: &[u8]) -> Result<String, DaemonError> {
        let h_method = hmac_once(&self.secret, method.to_uppercase().as_bytes())?;
        let h_path = hmac_once(&self.secret, path.as_bytes())?;
        let h_body = hmac_once(&self.secret, body)?;

        let mut combined = Vec::with_capacity(h_method.len() + h_path.len() + h_body.len());
        combined.extend_from_slice(&h_method);
        combined.extend_from_slice(&h_path);
        combined.extend_from_slice(&h_body);

        let h_final = hmac_once(&self.secret, &combined)?;
        Ok(BASE64.encode(h_final))
    }

    async fn request(&self, path: &str, body: Option<Value>) -> Result<Value, DaemonError> {
        let method = if body.is_some() { "POST" } else { "GET" };
        let body_bytes = match &body {
            Some(v) => serde_json::to_vec(v).map_err(|e| DaemonError::Protocol(e.to_string()))?,
            None => Vec::new(),
        };

        let signature = self.sign(method, path, &body_bytes)?;
        let url = format!("{}{}", self.base_url, path);

        let mut builder = if method == "POST" {
            self.http.post(&url).body(body_bytes)
        } else {
            self.http.get(&url)
        };
        builder = builder.header("X-Ycm-Hmac", signature).header("Content-Type", "application/json");

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| DaemonError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DaemonError::BadStatus { status: status.as_u16(), body: text });
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| DaemonError::Protocol(e.to_string()))
    }

    pub async fn ready(&self) -> Result<bool, DaemonError> {
        let response = self.request("/ready", None).await?;
        Ok(response.as_bool().unwrap_or(false))
    }

    pub async fn load_extra_conf_file(&self, path: &str) -> Result<(), DaemonError> {
        self.request("/load_extra_conf_file", Some(serde_json::json!({ "filepath": path })))
            .await
            .map(|_| ())
    }

    pub async fn completions(&self, position: &FilePosition) -> Result<Value, DaemonError> {
        self.request("/completions", Some(serde_json::to_value(position).unwrap())).await
    }

    pub async fn diagnostics(&self, filepath: &str, file_contents: &str) -> Result<Value, DaemonError> {
        self.request(
            "/diagnostics",
            Some(serde_json::json!({ "filepath": filepath, "file_contents": file_contents })),
        )
        .await
    }

    pub async fn goto_definition(&self, position: &FilePosition) -> Result<Value, DaemonError> {
        self.request("/goto_definition", Some(serde_json::to_value(position).unwrap())).await
    }

    pub async fn goto_declaration(&self, position: &FilePosition) -> Result<Value, DaemonError> {
        self.request("/goto_declaration", Some(serde_json::to_value(position).unwrap())).await
    }

    pub async fn goto_references(&self, position: &FilePosition) -> Result<Value, DaemonError> {
        self.request("/goto_references", Some(serde_json::to_value(position).unwrap())).await
    }

    pub async fn signature_help(&self, position: &FilePosition) -> Result<Value, DaemonError> {
        self.request("/signature_help", Some(serde_json::to_value(position).unwrap())).await
    }

    pub async fn refactor_rename(
        &self,
        position: &FilePosition,
        new_name: &str,
    ) -> Result<Value, DaemonError> {
        let mut payload = serde_json::to_value(position).unwrap();
        payload["command"] = serde_json::json!("RefactorRename");
        payload["new_name"] = serde_json::json!(new_name);
        self.request("/run_completer_command", Some(payload)).await
    }

    pub async fn extract_method(&self, position: &FilePosition) -> Result<Value, DaemonError> {
        let mut payload = serde_json::to_value(position).unwrap();
        payload["command"] = serde_json::json!("ExtractMethod");
        self.request("/run_completer_command", Some(payload)).await
    }

    pub async fn organize_imports(&self, position: &FilePosition) -> Result<Value, DaemonError> {
        let mut payload = serde_json::to_value(position).unwrap();
        payload["command"] = serde_json::json!("OrganizeImports");
        self.request("/run_completer_command", Some(payload)).await
    }

    pub async fn apply_fixit(&self, position: &FilePosition, index: usize) -> Result<Value, DaemonError> {
        let mut payload = serde_json::to_value(position).unwrap();
        payload["command"] = serde_json::json!("FixIt");
        payload["fixit_index"] = serde_json::json!(index);
        self.request("/run_completer_command", Some(payload)).await
    }

    async fn notify(&self, event: &str, position: &FilePosition) -> Result<(), DaemonError> {
        let mut payload = serde_json::to_value(position).unwrap();
        payload["event_name"] = serde_json::json!(event);
        self.request("/event_notification", Some(payload)).await.map(|_| ())
    }

    pub async fn notify_buffer_visit(&self, position: &FilePosition) -> Result<(), DaemonError> {
        self.notify("BufferVisit", position).await
    }

    pub async fn notify_buffer_unload(&self, position: &FilePosition) -> Result<(), DaemonError> {
        self.notify("BufferUnload", position).await
    }

    pub async fn notify_file_ready_to_parse(&self, position: &FilePosition) -> Result<(), DaemonError> {
        self.notify("FileReadyToParse", position).await
    }

    pub async fn notify_insert_leave(&self, position: &FilePosition) -> Result<(), DaemonError> {
        self.notify("InsertLeave", position).await
    }

    pub async fn notify_current_identifier_finished(
        &self,
        position: &FilePosition,
    ) -> Result<(), DaemonError> {
        self.notify("CurrentIdentifierFinished", position).await
    }

    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        self.request("/shutdown", Some(Value::Null)).await.map(|_| ())
    }
}

fn hmac_once(secret: &[u8], data: &[u8]) -> Result<Vec<u8>, DaemonError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| DaemonError::Hmac(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_inputs() {
        let client = DaemonClient::new("127.0.0.1", 8080, &BASE64.encode(b"0123456789abcdef")).unwrap();
        let a = client.sign("GET", "/ready", b"").unwrap();
        let b = client.sign("GET", "/ready", b"").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sign_differs_by_path() {
        let client = DaemonClient::new("127.0.0.1", 8080, &BASE64.encode(b"0123456789abcdef")).unwrap();
        let a = client.sign("GET", "/ready", b"").unwrap();
        let b = client.sign("GET", "/completions", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sign_differs_by_secret_and_matches_when_recomputed_with_the_same_secret() {
        let method = "POST";
        let path = "/completions";
        let body = br#"{"filepath":"a.rs"}"#;

        let a1 = DaemonClient::new("127.0.0.1", 8080, &BASE64.encode(b"secret-one-aaaaa")).unwrap();
        let a2 = DaemonClient::new("127.0.0.1", 8080, &BASE64.encode(b"secret-one-aaaaa")).unwrap();
        let b = DaemonClient::new("127.0.0.1", 8080, &BASE64.encode(b"secret-two-bbbbb")).unwrap();

        let sig_a1 = a1.sign(method, path, body).unwrap();
        let sig_a2 = a2.sign(method, path, body).unwrap();
        let sig_b = b.sign(method, path, body).unwrap();

        assert_eq!(sig_a1, sig_a2, "same secret must recompute the same signature");
        assert_ne!(sig_a1, sig_b, "different secrets must produce different signatures");
    }

    #[test]
    fn empty_secret_marks_unauthenticated() {
        let client = DaemonClient::new("127.0.0.1", 8080, "").unwrap();
        assert!(!client.is_authenticated());
    }

    #[test]
    fn non_empty_secret_marks_authenticated() {
        let client = DaemonClient::new("127.0.0.1", 8080, &BASE64.encode(b"0123456789abcdef")).unwrap();
        assert!(client.is_authenticated());
    }
}
