use crate::error::{Error, Result};
use crate::frame::WireMode;
use mac_address::get_mac_address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Wire serialization requested from the server via the `serializer` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerMode {
    /// Audio and JSON frames carry a type tag and length prefix.
    #[default]
    Raw,
    /// JSON frames start with `{`, everything else is 24 kHz PCM16.
    RawNoHeader,
    Protobuf,
    Opus,
}

impl SerializerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerializerMode::Raw => "raw",
            SerializerMode::RawNoHeader => "raw_no_header",
            SerializerMode::Protobuf => "protobuf",
            SerializerMode::Opus => "opus",
        }
    }

    /// Demultiplexer layout for inbound binary frames, `None` when the
    /// client has no decoder for this serializer.
    pub fn wire_mode(&self) -> Option<WireMode> {
        match self {
            SerializerMode::Raw => Some(WireMode::Headered),
            SerializerMode::RawNoHeader => Some(WireMode::Headerless),
            SerializerMode::Protobuf | SerializerMode::Opus => None,
        }
    }
}

impl fmt::Display for SerializerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerializerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(SerializerMode::Raw),
            "raw_no_header" => Ok(SerializerMode::RawNoHeader),
            "protobuf" => Ok(SerializerMode::Protobuf),
            "opus" => Ok(SerializerMode::Opus),
            other => Err(format!(
                "unknown serializer '{}', expected raw|raw_no_header|protobuf|opus",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub gui: GuiConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub server_url: String,
    pub app_identifier: String,
    pub version: String,
    /// Empty means: derive from the MAC address, else a random UUID.
    pub user_id: String,
    pub language: String,
    pub serializer: SerializerMode,
    /// Reconnect with exponential backoff after the socket drops.
    pub reconnect: bool,
    pub max_retry_delay_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3001/user-audio-input".to_string(),
            app_identifier: "ziggy_ai".to_string(),
            version: "v1_0_0".to_string(),
            user_id: "test-user-1".to_string(),
            language: "en".to_string(),
            serializer: SerializerMode::Raw,
            reconnect: false,
            max_retry_delay_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AudioConfig {
    /// Audio accumulated before playback starts.
    pub buffer_ms: u32,
    pub capture_sample_rate: u32,
    /// Rate the playback device is opened at.
    pub output_sample_rate: u32,
    /// Samples per outbound capture packet.
    pub capture_frames: usize,
    /// Wait after the last chunk finishes before declaring the buffer drained.
    pub grace_ms: u64,
    /// Headroom between priming and the first scheduled chunk.
    pub start_lead_ms: u64,
    pub capture_device: String,
    pub playback_device: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            buffer_ms: 300,
            capture_sample_rate: 16000,
            output_sample_rate: 24000,
            capture_frames: 4096,
            grace_ms: 100,
            start_lead_ms: 50,
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
        }
    }
}

impl AudioConfig {
    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.buffer_ms as u64)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn start_lead(&self) -> Duration {
        Duration::from_millis(self.start_lead_ms)
    }
}

// UI 进程通过本地 UDP 通信
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GuiConfig {
    pub enabled: bool,
    pub local_port: u16,
    pub remote_port: u16,
    pub buffer_size: usize,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_port: 5678,
            remote_port: 5679,
            buffer_size: 4096,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered with `ZIGGY_`
    /// environment variables (`ZIGGY_AUDIO__BUFFER_MS=500`).
    ///
    /// When `path` is `None` the default `config.toml` is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(file).required(path.is_some()))
            .add_source(
                ::config::Environment::with_prefix("ZIGGY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        config.resolve_user_id();
        config.validate()?;
        Ok(config)
    }

    /// Fill an empty user id from the MAC address, else a fresh UUID.
    pub fn resolve_user_id(&mut self) {
        if !self.network.user_id.trim().is_empty() {
            return;
        }
        self.network.user_id = match get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            _ => Uuid::new_v4().to_string(),
        };
        log::info!("Using generated user id {}", self.network.user_id);
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.buffer_ms == 0 {
            return Err(Error::InvalidConfig("audio.buffer_ms must be positive".into()));
        }
        if self.audio.capture_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(Error::InvalidConfig("sample rates must be positive".into()));
        }
        if self.audio.capture_frames == 0 {
            return Err(Error::InvalidConfig(
                "audio.capture_frames must be positive".into(),
            ));
        }
        let url = self.parse_server_url()?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "server url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        Ok(())
    }

    /// Server URL with the identification query parameters appended.
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = self.parse_server_url()?;
        url.query_pairs_mut()
            .append_pair("appIdentifier", &self.network.app_identifier)
            .append_pair("version", &self.network.version)
            .append_pair("language", &self.network.language)
            .append_pair("userId", &self.network.user_id)
            .append_pair("serializer", self.network.serializer.as_str());
        Ok(url)
    }

    fn parse_server_url(&self) -> Result<Url> {
        Url::parse(&self.network.server_url).map_err(|e| {
            Error::InvalidConfig(format!("bad server url '{}': {}", self.network.server_url, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_client() {
        let config = Config::default();
        assert_eq!(config.network.serializer, SerializerMode::Raw);
        assert_eq!(config.audio.buffer_ms, 300);
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.grace_delay(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn connect_url_carries_query_parameters() {
        let mut config = Config::default();
        config.network.serializer = SerializerMode::RawNoHeader;
        config.network.user_id = "user 7".to_string();

        let url = config.connect_url().unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.path(), "/user-audio-input");
        assert!(pairs.contains(&("appIdentifier".into(), "ziggy_ai".into())));
        assert!(pairs.contains(&("version".into(), "v1_0_0".into())));
        assert!(pairs.contains(&("language".into(), "en".into())));
        assert!(pairs.contains(&("userId".into(), "user 7".into())));
        assert!(pairs.contains(&("serializer".into(), "raw_no_header".into())));
    }

    #[test]
    fn serializer_parsing_and_wire_modes() {
        assert_eq!("raw".parse::<SerializerMode>(), Ok(SerializerMode::Raw));
        assert_eq!(
            "raw_no_header".parse::<SerializerMode>(),
            Ok(SerializerMode::RawNoHeader)
        );
        assert!("json".parse::<SerializerMode>().is_err());

        assert_eq!(SerializerMode::Raw.wire_mode(), Some(WireMode::Headered));
        assert_eq!(SerializerMode::RawNoHeader.wire_mode(), Some(WireMode::Headerless));
        assert_eq!(SerializerMode::Opus.wire_mode(), None);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.audio.buffer_ms = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.network.server_url = "http://localhost:3001".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn empty_user_id_is_generated() {
        let mut config = Config::default();
        config.network.user_id = String::new();
        config.resolve_user_id();
        assert!(!config.network.user_id.is_empty());
    }

    #[test]
    fn load_reads_toml_file() {
        let path = std::env::temp_dir().join(format!("ziggy-{}.toml", Uuid::new_v4()));
        std::fs::write(
            &path,
            "[network]\nserializer = \"raw_no_header\"\nlanguage = \"de\"\n\n[audio]\nbuffer_ms = 500\n",
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.network.serializer, SerializerMode::RawNoHeader);
        assert_eq!(config.network.language, "de");
        assert_eq!(config.audio.buffer_ms, 500);
        assert_eq!(config.audio.capture_sample_rate, 16000);
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let path = std::env::temp_dir().join(format!("missing-{}.toml", Uuid::new_v4()));
        assert!(Config::load(Some(path.as_path())).is_err());
    }
}
