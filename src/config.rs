use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 7878;

/// Runtime settings, read once at startup from `config.json` in the app data
/// dir. Every key is optional; missing keys fall back to defaults so a fresh
/// install needs no config file at all.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Explicit llama-server path; when absent the binary is looked up on
    /// PATH.
    pub server_bin: Option<PathBuf>,
}

impl AppConfig {
    pub fn load() -> Self {
        let data_dir = std::env::var_os("CONFAB_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("confab")
            });
        Self::load_from(data_dir)
    }

    pub fn load_from(data_dir: PathBuf) -> Self {
        let config_path = data_dir.join("config.json");
        let config: serde_json::Value = std::fs::read_to_string(&config_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null);

        let models_dir = config
            .get("modelsDir")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("models"));

        let port = config
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_PORT);

        let server_bin = config
            .get("llamaServerPath")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);

        Self {
            data_dir,
            models_dir,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            server_bin,
        }
    }
}
