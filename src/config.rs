use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use anyhow::{Context, bail};

use crate::model::DeviceKind;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub default_model: String,
    pub preload_default_model: bool,
    pub models_dir: PathBuf,
    pub max_new_tokens: usize,
    pub max_input_tokens: usize,
    pub device: DeviceSetting,
    pub stream_buffer: usize,
}

/// Device requested by configuration. `Auto` is resolved once by the backend
/// when the model manager is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSetting {
    Auto,
    Fixed(DeviceKind),
}

impl FromStr for DeviceSetting {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "auto" | "" => Ok(DeviceSetting::Auto),
            "cpu" => Ok(DeviceSetting::Fixed(DeviceKind::Cpu)),
            "cuda" => Ok(DeviceSetting::Fixed(DeviceKind::Cuda)),
            "mps" => Ok(DeviceSetting::Fixed(DeviceKind::Mps)),
            other => bail!("unsupported DEVICE value '{other}', expected auto, cpu, cuda or mps"),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000),
            default_model: "microsoft/DialoGPT-medium".to_string(),
            preload_default_model: false,
            models_dir: PathBuf::from("./models"),
            max_new_tokens: 256,
            max_input_tokens: 2048,
            device: DeviceSetting::Auto,
            stream_buffer: 1,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host: IpAddr = match lookup("HOST") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid HOST value '{raw}'"))?,
            None => defaults.listen_addr.ip(),
        };
        let port = parse_or(&lookup, "PORT", defaults.listen_addr.port())?;

        let default_model = lookup("DEFAULT_MODEL").unwrap_or(defaults.default_model);
        let preload_default_model = lookup("PRELOAD_DEFAULT_MODEL")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.preload_default_model);
        let models_dir = lookup("MODELS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.models_dir);

        let max_new_tokens = parse_or(&lookup, "MAX_NEW_TOKENS", defaults.max_new_tokens)?;
        let max_input_tokens = parse_or(&lookup, "MAX_INPUT_TOKENS", defaults.max_input_tokens)?;
        let stream_buffer = parse_or(&lookup, "STREAM_BUFFER", defaults.stream_buffer)?.max(1);

        let device = match lookup("DEVICE") {
            Some(raw) => raw.parse()?,
            None => defaults.device,
        };

        Ok(Self {
            listen_addr: SocketAddr::new(host, port),
            default_model,
            preload_default_model,
            models_dir,
            max_new_tokens,
            max_input_tokens,
            device,
            stream_buffer,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key} value '{raw}'")),
        None => Ok(default),
    }
}
