//! server configuration tree
//!
//! The config is a nested structure parsed from JSON at startup. Every
//! numeric field treats zero as "use the built in default", so partial
//! configs stay valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ServerError;

/// default timeout between accept and first inbound byte
pub const DEFAULT_ACCEPT_TO_IO_USEC: u64 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub debug: bool,
    pub ip4_only: bool,
    pub sockets: SocketsConfig,
    pub timer: TimerConfig,
    pub limits: LimitsConfig,
    pub http_message: HttpMessageConfig,
    pub websocket: FrameConfig,
    /// directory of per domain descriptor files
    pub domains: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            debug: false,
            ip4_only: false,
            sockets: SocketsConfig::default(),
            timer: TimerConfig::default(),
            limits: LimitsConfig::default(),
            http_message: HttpMessageConfig::default(),
            websocket: FrameConfig::default(),
            domains: PathBuf::new(),
        }
    }
}

impl ServerConfig {
    /// fill every zero field with its default
    pub fn init(mut self) -> Self {
        if self.name.is_empty() {
            self.name = "snigate".into();
        }
        if self.limits.sockets == 0 {
            self.limits.sockets = 4096;
        }
        if self.timer.accept == 0 {
            self.timer.accept = DEFAULT_ACCEPT_TO_IO_USEC;
        }
        self.http_message = self.http_message.init();
        self.websocket = self.websocket.init();
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Ok(config.init())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SocketsConfig {
    /// optional plain TCP listener answering with a redirect to `https`
    pub http: Option<SocketSpec>,
    pub https: SocketSpec,
    /// collaborator surface, parsed but not served here
    pub stun: Vec<SocketSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SocketSpec {
    pub host: String,
    pub port: u16,
}

impl Default for SocketSpec {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
        }
    }
}

impl SocketSpec {
    /// address to bind, honoring `ip4_only` when no host is configured
    pub fn bind_host(&self, ip4_only: bool) -> &str {
        if !self.host.is_empty() {
            self.host.as_str()
        } else if ip4_only {
            "0.0.0.0"
        } else {
            "::"
        }
    }
}

/// timeouts in microseconds; `io` of zero disables the idle check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TimerConfig {
    pub io: u64,
    pub accept: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LimitsConfig {
    /// maximum number of concurrently open connections
    pub sockets: usize,
    /// max content bytes per outgoing websocket frame,
    /// longer JSON replies are sent as a fragmented sequence
    pub websocket: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HttpMessageConfig {
    pub header: HeaderConfig,
    pub buffer: BufferConfig,
    pub transfer: TransferConfig,
    pub chunk: ChunkConfig,
}

impl HttpMessageConfig {
    pub fn init(mut self) -> Self {
        if self.header.capacity == 0 {
            self.header.capacity = 32;
        }
        if self.header.method == 0 {
            self.header.method = 16;
        }
        if self.header.lines == 0 {
            self.header.lines = 2048;
        }
        if self.buffer.size == 0 {
            self.buffer.size = 4096;
        }
        if self.transfer.max == 0 {
            self.transfer.max = 1;
        }
        if self.chunk.max == 0 {
            self.chunk.max = 1 << 20;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HeaderConfig {
    /// amount of header lines supported
    pub capacity: usize,
    /// max bytes of a method name
    pub method: usize,
    /// max bytes of a header line
    pub lines: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BufferConfig {
    /// default buffer size of a fresh parse object
    pub size: usize,
    /// buffers grown beyond this are released instead of recycled,
    /// zero keeps every buffer
    #[serde(rename = "max cache")]
    pub max_cache: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TransferConfig {
    /// max transfer encodings allowed
    pub max: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ChunkConfig {
    /// max chunk size allowed
    pub max: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FrameConfig {
    pub buffer: BufferConfig,
}

impl FrameConfig {
    pub fn init(mut self) -> Self {
        if self.buffer.size == 0 {
            self.buffer.size = 4096;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_take_defaults() {
        let config = ServerConfig::default().init();
        assert_eq!(config.name, "snigate");
        assert_eq!(config.limits.sockets, 4096);
        assert_eq!(config.timer.accept, DEFAULT_ACCEPT_TO_IO_USEC);
        assert_eq!(config.timer.io, 0);
        assert_eq!(config.http_message.header.capacity, 32);
        assert_eq!(config.http_message.header.method, 16);
        assert_eq!(config.http_message.buffer.size, 4096);
        assert_eq!(config.websocket.buffer.size, 4096);
    }

    #[test]
    fn configured_values_survive_init() {
        let mut config = ServerConfig::default();
        config.http_message.header.capacity = 7;
        config.timer.accept = 42;
        let config = config.init();
        assert_eq!(config.http_message.header.capacity, 7);
        assert_eq!(config.timer.accept, 42);
    }

    #[test]
    fn parses_the_config_tree() {
        let raw = r#"{
            "name": "edge",
            "debug": true,
            "sockets": {
                "https": { "host": "127.0.0.1", "port": 12345 },
                "http": { "host": "127.0.0.1", "port": 12344 },
                "stun": [ { "host": "127.0.0.1", "port": 3478 } ]
            },
            "timer": { "io": 0, "accept": 500000 },
            "limits": { "sockets": 128, "websocket": 16000 },
            "http_message": {
                "header": { "capacity": 16, "method": 8, "lines": 512 },
                "buffer": { "size": 1024, "max cache": 4096 },
                "transfer": { "max": 2 },
                "chunk": { "max": 65536 }
            },
            "websocket": { "buffer": { "size": 500, "max cache": 1048576 } },
            "domains": "/etc/snigate/domains"
        }"#;
        let config: ServerConfig = serde_json::from_str(raw).unwrap();
        let config = config.init();
        assert_eq!(config.name, "edge");
        assert!(config.debug);
        assert_eq!(config.sockets.https.port, 12345);
        assert_eq!(config.sockets.http.as_ref().unwrap().port, 12344);
        assert_eq!(config.sockets.stun.len(), 1);
        assert_eq!(config.limits.websocket, 16000);
        assert_eq!(config.http_message.buffer.max_cache, 4096);
        assert_eq!(config.websocket.buffer.size, 500);
        assert_eq!(config.domains, PathBuf::from("/etc/snigate/domains"));
    }

    #[test]
    fn bind_host_honors_ip4_only() {
        let spec = SocketSpec::default();
        assert_eq!(spec.bind_host(true), "0.0.0.0");
        assert_eq!(spec.bind_host(false), "::");
        let spec = SocketSpec {
            host: "10.0.0.1".into(),
            port: 443,
        };
        assert_eq!(spec.bind_host(true), "10.0.0.1");
    }
}
