use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Runtime configuration. Serialized into the hello response so clients can
/// discover the frame geometry they are about to receive.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Path of the Unix socket the server listens on.
    pub socket_path: String,
    /// Frame width in pixels.
    pub frame_width: u32,
    /// Frame height in pixels.
    pub frame_height: u32,
    /// Frames per second produced by the source.
    pub frame_rate: u32,
    /// Seconds a freshly accepted client gets to send its hello.
    pub client_hello_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/framecast.sock".to_string(),
            frame_width: 640,
            frame_height: 480,
            frame_rate: 30,
            client_hello_timeout: 2,
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file. Missing fields fall back to
    /// their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// One frame's payload size in bytes: 8-bit intensity per pixel.
    pub fn frame_size(&self) -> usize {
        (self.frame_width * self.frame_height) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_size() {
        let config = Config::default();
        assert_eq!(config.frame_size(), 640 * 480);
    }

    #[test]
    fn partial_config_file_falls_back_to_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"frameWidth":32,"frameHeight":24}"#).unwrap();
        assert_eq!(config.frame_width, 32);
        assert_eq!(config.frame_height, 24);
        assert_eq!(config.frame_rate, Config::default().frame_rate);
        assert_eq!(config.socket_path, Config::default().socket_path);
    }

    #[test]
    fn config_round_trips_in_camel_case() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert!(json.get("socketPath").is_some());
        assert!(json.get("clientHelloTimeout").is_some());
    }
}
