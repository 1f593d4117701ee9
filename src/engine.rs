use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::catalog;

/// A GGUF file sitting in the models directory. The id is the filename minus
/// its extension and is what gets persisted as the selected model.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalModel {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

pub type TokenCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Everything the rest of the app needs from the inference runtime: local
/// file enumeration, fetching by source repo, and cancellable token
/// streaming. Orchestration code only sees this trait, so tests substitute
/// scripted doubles for the real llama-server process.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    fn list_models(&self) -> Vec<LocalModel>;

    fn resolve(&self, id: &str) -> Option<PathBuf> {
        self.list_models().into_iter().find(|m| m.id == id).map(|m| m.path)
    }

    async fn download(
        &self,
        source_repo: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, String>;

    /// Streams a completion for the final user turn, invoking `on_token` per
    /// produced fragment, and returns the accumulated text. Stops promptly
    /// once `cancel` fires, returning whatever was produced so far.
    async fn stream_chat(
        &self,
        model_path: &Path,
        messages: &[ChatMessage],
        on_token: TokenCallback,
        cancel: CancellationToken,
    ) -> Result<String, String>;

    async fn complete(&self, model_path: &Path, messages: &[ChatMessage]) -> Result<String, String> {
        self.stream_chat(model_path, messages, Box::new(|_| {}), CancellationToken::new())
            .await
    }
}

pub fn id_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Roughly what fits in the 4096-token window the server is started with,
/// leaving room for the reply.
const CONTEXT_CHAR_BUDGET: usize = 12_000;

/// Bounded prompt assembly: the system message (if any) is pulled out and
/// replayed first, then the most recent turns that fit the budget. The final
/// turn is always kept, even oversized.
pub fn context_window(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let system = messages.iter().find(|m| m.role == "system").cloned();
    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();

    let mut budget =
        CONTEXT_CHAR_BUDGET.saturating_sub(system.as_ref().map(|m| m.content.len()).unwrap_or(0));
    let mut kept: Vec<ChatMessage> = Vec::new();
    for turn in turns.iter().rev() {
        if !kept.is_empty() && turn.content.len() > budget {
            break;
        }
        budget = budget.saturating_sub(turn.content.len());
        kept.push((*turn).clone());
    }
    kept.reverse();

    let mut out = Vec::with_capacity(kept.len() + 1);
    if let Some(system) = system {
        out.push(system);
    }
    out.extend(kept);
    out
}

// ---------------------------------------------------------------------------
// llama-server backed engine
// ---------------------------------------------------------------------------

const LOAD_TIMEOUT: Duration = Duration::from_secs(60);

struct ServerProcess {
    child: Child,
    port: u16,
    model_path: PathBuf,
}

impl ServerProcess {
    fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn stop(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Engine that runs models through a local llama-server subprocess. Exactly
/// one server is resident; loading a different model kills the previous
/// process before spawning the next. The mutex is held for the whole of each
/// streaming call so a model switch can never interleave with an in-flight
/// completion.
pub struct LlamaServerEngine {
    models_dir: PathBuf,
    server_bin: Option<PathBuf>,
    http: reqwest::Client,
    runtime: tokio::sync::Mutex<Option<ServerProcess>>,
}

impl LlamaServerEngine {
    pub fn new(models_dir: PathBuf, server_bin: Option<PathBuf>) -> Result<Self, String> {
        let server_bin = server_bin.or_else(|| which::which("llama-server").ok());
        match &server_bin {
            Some(bin) => log::info!("[engine] using llama-server at {}", bin.display()),
            None => log::warn!(
                "[engine] llama-server not found on PATH; chat will be unavailable until one is installed"
            ),
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            models_dir,
            server_bin,
            http,
            runtime: tokio::sync::Mutex::new(None),
        })
    }

    /// Reuses the resident server when it already has `model_path` loaded,
    /// otherwise disposes it and spawns a fresh one. Returns the port to talk
    /// to.
    async fn ensure_loaded(
        &self,
        runtime: &mut Option<ServerProcess>,
        model_path: &Path,
    ) -> Result<u16, String> {
        if let Some(server) = runtime.as_mut() {
            if server.model_path == model_path && server.alive() {
                return Ok(server.port);
            }
        }
        if let Some(server) = runtime.take() {
            log::info!("[engine] unloading {}", server.model_path.display());
            server.stop();
        }

        let bin = self
            .server_bin
            .as_ref()
            .ok_or_else(|| "llama-server binary not found".to_string())?;
        let port = pick_free_port()?;

        log::info!("[engine] loading {} on port {}", model_path.display(), port);
        let child = Command::new(bin)
            .arg("-m")
            .arg(model_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--ctx-size")
            .arg("4096")
            .arg("--jinja")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to start llama-server: {e}"))?;

        let mut server = ServerProcess { child, port, model_path: model_path.to_path_buf() };
        if !wait_port_open(port, LOAD_TIMEOUT).await || !server.alive() {
            server.stop();
            return Err("llama-server failed to start".to_string());
        }
        *runtime = Some(server);
        Ok(port)
    }
}

impl Drop for LlamaServerEngine {
    fn drop(&mut self) {
        if let Some(server) = self.runtime.get_mut().take() {
            server.stop();
        }
    }
}

#[async_trait]
impl LlmEngine for LlamaServerEngine {
    fn list_models(&self) -> Vec<LocalModel> {
        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(_) => return vec![],
        };
        let mut out: Vec<LocalModel> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| e.eq_ignore_ascii_case("gguf"))
                        .unwrap_or(false)
            })
            .map(|path| LocalModel { id: id_from_path(&path), path })
            .filter(|m| !m.id.is_empty())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    async fn download(
        &self,
        source_repo: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, String> {
        let dest = self.models_dir.join(catalog::model_file_name(source_repo));
        if dest.exists() {
            return Ok(dest);
        }
        std::fs::create_dir_all(&self.models_dir).map_err(|e| e.to_string())?;

        let url = catalog::download_url(source_repo);
        let tmp_path = dest.with_extension("part");
        log::info!("[engine] downloading {url}");

        let result = self.fetch_to_file(&url, &tmp_path, cancel).await;
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }

        if !file_starts_with(&tmp_path, b"GGUF") {
            let _ = std::fs::remove_file(&tmp_path);
            return Err("downloaded model is not a GGUF file (signature mismatch)".to_string());
        }
        std::fs::rename(&tmp_path, &dest).map_err(|e| e.to_string())?;
        log::info!("[engine] saved {}", dest.display());
        Ok(dest)
    }

    async fn stream_chat(
        &self,
        model_path: &Path,
        messages: &[ChatMessage],
        on_token: TokenCallback,
        cancel: CancellationToken,
    ) -> Result<String, String> {
        let mut runtime = self.runtime.lock().await;
        let port = self.ensure_loaded(&mut runtime, model_path).await?;

        let body = serde_json::json!({
            "messages": context_window(messages),
            "stream": true,
        });
        let resp = self
            .http
            .post(format!("http://127.0.0.1:{port}/v1/chat/completions"))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("completion request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("engine returned HTTP {}", resp.status()));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => return Err(format!("stream read error: {e}")),
                    None => break,
                },
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].to_string();
                buffer = buffer[newline_pos + 1..].to_string();

                let trimmed = line.trim();
                let Some(data) = trimmed.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let value: serde_json::Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                    if !delta.is_empty() && !cancel.is_cancelled() {
                        text.push_str(delta);
                        on_token(delta);
                    }
                }
            }
        }

        Ok(text)
    }
}

impl LlamaServerEngine {
    async fn fetch_to_file(
        &self,
        url: &str,
        tmp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let resp = self.http.get(url).send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("{url} -> HTTP {}", resp.status()));
        }
        let expected_len = resp.content_length();

        let mut file = std::fs::File::create(tmp_path).map_err(|e| e.to_string())?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        let mut last_log = Instant::now();
        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                return Err("download cancelled".to_string());
            }
            let chunk = item.map_err(|e| e.to_string())?;
            use std::io::Write;
            file.write_all(&chunk).map_err(|e| e.to_string())?;
            written = written.saturating_add(chunk.len() as u64);
            if last_log.elapsed() >= Duration::from_secs(5) {
                match expected_len {
                    Some(total) => log::info!(
                        "[engine] downloaded {}/{} MB",
                        written / 1024 / 1024,
                        total / 1024 / 1024
                    ),
                    None => log::info!("[engine] downloaded {} MB", written / 1024 / 1024),
                }
                last_log = Instant::now();
            }
        }

        if let Some(len) = expected_len {
            if written != len {
                return Err(format!("incomplete download ({written}/{len} bytes)"));
            }
        }
        Ok(())
    }
}

fn pick_free_port() -> Result<u16, String> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|e| e.to_string())?;
    let port = listener.local_addr().map_err(|e| e.to_string())?.port();
    drop(listener);
    Ok(port)
}

async fn wait_port_open(port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    false
}

fn file_starts_with(path: &Path, magic: &[u8]) -> bool {
    let mut buf = vec![0u8; magic.len()];
    let mut f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    use std::io::Read;
    if f.read_exact(&mut buf).is_err() {
        return false;
    }
    buf == magic
}
