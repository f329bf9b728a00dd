//! Server configuration and channel options
//!
//! [`ConsConfig`] holds the process-wide defaults. It is handed to the
//! server once and consulted for every channel created afterwards; channel
//! creation options ([`ChannelOptions`]) override the defaults per channel.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::client::Key;
use crate::{ConsError, Result};

/// Smallest output buffer a channel gets
pub const MIN_OBUF_SIZE: usize = 512;
/// Largest output buffer a channel gets
pub const MAX_OBUF_SIZE: usize = 16 << 20;

/// Console server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsConfig {
    /// Show new channels on the first multiplexer
    pub default_show_all: bool,
    /// Keep channels after their peer disconnected
    pub default_keep: bool,
    pub default_line_buffering: bool,
    /// Flush delay for incomplete lines
    pub default_line_buffering_ms: u64,
    /// Prefix every output line with the local time
    pub default_timestamp: bool,
    /// Output buffer size when a channel does not ask for one
    pub default_obuf_size: usize,
    pub input_buf_size: usize,
    /// Registry capacity (channels, frontends and the factory)
    pub max_objects: usize,
    /// Pending output buffer of a virtio frontend
    pub frontend_buf_size: usize,
    /// Queue size advertised by virtio devices
    pub virtio_max_desc: u16,
}

impl Default for ConsConfig {
    fn default() -> Self {
        Self {
            default_show_all: false,
            default_keep: false,
            default_line_buffering: true,
            default_line_buffering_ms: 50,
            default_timestamp: false,
            default_obuf_size: 40960,
            input_buf_size: 512,
            max_objects: 256,
            frontend_buf_size: 40960,
            virtio_max_desc: cons_virtio::DEFAULT_MAX_DESC,
        }
    }
}

impl ConsConfig {
    /// Parse a TOML manifest; missing keys keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ConsError::Config(e.to_string()))
    }

    /// Load a TOML manifest from disk
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConsError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Serialize as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConsError::Config(e.to_string()))
    }

    /// Default output buffer size, clamped to the accepted range
    pub fn default_obuf_size(&self) -> usize {
        self.default_obuf_size.clamp(MIN_OBUF_SIZE, MAX_OBUF_SIZE)
    }

    /// Output buffer size for a channel that asked for `bufsz` bytes
    ///
    /// Requests below the minimum fall back to the default.
    pub fn output_buf_size(&self, bufsz: usize) -> usize {
        if bufsz < MIN_OBUF_SIZE {
            self.default_obuf_size()
        } else {
            bufsz.min(MAX_OBUF_SIZE)
        }
    }
}

/// Console colour, 0-7 normal and 8-15 bright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(u8);

impl Default for Color {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Color {
    /// White, used when a channel names no colour
    pub const DEFAULT: Color = Color(7);

    const NAMES: &'static [u8] = b"nrgybmcw";

    /// Colour from its number
    pub fn new(value: u8) -> Result<Self> {
        if value > 15 {
            return Err(ConsError::InvalidColor(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Colour from a name, only the first letter counts
    ///
    /// `n r g y b m c w` select the normal colours, upper case selects the
    /// bright variant. An empty name is the default colour.
    pub fn from_name(name: &str) -> Result<Self> {
        let Some(&first) = name.as_bytes().first() else {
            return Ok(Self::DEFAULT);
        };

        let bright = first.is_ascii_uppercase();
        let base = Self::NAMES
            .iter()
            .position(|&c| c == first.to_ascii_lowercase())
            .ok_or_else(|| ConsError::InvalidColor(name.to_string()))?;
        Ok(Self(((bright as u8) << 3) | base as u8))
    }

    /// Colour number
    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_bright(self) -> bool {
        self.0 & 8 != 0
    }

    /// ANSI escape sequence selecting this colour as foreground
    pub fn ansi(self) -> String {
        let base = 30 + (self.0 & 7);
        if self.is_bright() {
            format!("\x1b[1;{}m", base)
        } else {
            format!("\x1b[{}m", base)
        }
    }
}

impl FromStr for Color {
    type Err = ConsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.parse::<u8>() {
            Ok(v) => Self::new(v),
            Err(_) => Self::from_name(s),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Colour as given in a channel-creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSpec {
    Name(String),
    Value(i64),
}

impl ColorSpec {
    /// Resolve to a colour; `None` selects the default
    pub fn resolve(spec: Option<&ColorSpec>) -> Result<Color> {
        match spec {
            None => Ok(Color::DEFAULT),
            Some(ColorSpec::Name(name)) => Color::from_name(name),
            Some(ColorSpec::Value(v)) => u8::try_from(*v)
                .map_err(|_| ConsError::InvalidColor(v.to_string()))
                .and_then(Color::new),
        }
    }
}

/// Per-channel options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub show: bool,
    pub keep: bool,
    pub line_buffering: bool,
    pub line_buffering_ms: u64,
    pub timestamp: bool,
    pub key: Key,
    /// Requested output buffer size, 0 for the default
    pub bufsz: usize,
}

impl ChannelOptions {
    /// Options a channel gets when it passes none
    pub fn defaults(config: &ConsConfig) -> Self {
        Self {
            show: config.default_show_all,
            keep: config.default_keep,
            line_buffering: config.default_line_buffering,
            line_buffering_ms: config.default_line_buffering_ms,
            timestamp: config.default_timestamp,
            key: Key::nil(),
            bufsz: 0,
        }
    }

    /// Apply option strings on top of the configured defaults
    ///
    /// Later options override earlier ones. Unknown options are ignored.
    ///
    /// # Errors
    /// [`ConsError::InvalidOption`] for a non-numeric `line-buffered-ms=` or
    /// `bufsz=` value and for an empty `key=`.
    pub fn parse<S: AsRef<str>>(config: &ConsConfig, opts: &[S]) -> Result<Self> {
        let mut o = Self::defaults(config);

        for opt in opts {
            let opt = opt.as_ref();
            match opt {
                "hide" => o.show = false,
                "show" => o.show = true,
                "keep" => o.keep = true,
                "no-keep" => o.keep = false,
                "line-buffering" => o.line_buffering = true,
                "no-line-buffering" => o.line_buffering = false,
                "timestamp" => o.timestamp = true,
                "no-timestamp" => o.timestamp = false,
                _ => {
                    if let Some(v) = opt.strip_prefix("line-buffered-ms=") {
                        o.line_buffering_ms = parse_number(opt, v)?;
                    } else if let Some(v) = opt.strip_prefix("bufsz=") {
                        o.bufsz = parse_number(opt, v)?;
                    } else if let Some(v) = opt.strip_prefix("key=") {
                        let &k = v
                            .as_bytes()
                            .first()
                            .ok_or_else(|| ConsError::InvalidOption(opt.to_string()))?;
                        o.key = Key::new(k);
                    } else {
                        debug!("ignoring unknown channel option '{}'", opt);
                    }
                }
            }
        }

        Ok(o)
    }
}

fn parse_number<T: FromStr>(opt: &str, v: &str) -> Result<T> {
    v.parse()
        .map_err(|_| ConsError::InvalidOption(opt.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsConfig::default();
        let o = ChannelOptions::parse::<&str>(&config, &[]).unwrap();
        assert!(!o.show);
        assert!(!o.keep);
        assert!(o.line_buffering);
        assert_eq!(o.line_buffering_ms, 50);
        assert!(o.key.is_nil());
    }

    #[test]
    fn test_parse_options() {
        let config = ConsConfig::default();
        let o = ChannelOptions::parse(
            &config,
            &["show", "keep", "no-line-buffering", "line-buffered-ms=100", "timestamp", "key=v", "bufsz=8192"],
        )
        .unwrap();

        assert!(o.show && o.keep && o.timestamp);
        assert!(!o.line_buffering);
        assert_eq!(o.line_buffering_ms, 100);
        assert_eq!(o.key, Key::new(b'v'));
        assert_eq!(o.bufsz, 8192);
    }

    #[test]
    fn test_later_options_win() {
        let config = ConsConfig {
            default_show_all: true,
            ..ConsConfig::default()
        };
        let o = ChannelOptions::parse(&config, &["hide", "show", "hide"]).unwrap();
        assert!(!o.show);
    }

    #[test]
    fn test_unknown_option_ignored() {
        let config = ConsConfig::default();
        assert!(ChannelOptions::parse(&config, &["frobnicate", "show"]).unwrap().show);
    }

    #[test]
    fn test_malformed_numbers_rejected() {
        let config = ConsConfig::default();
        assert!(matches!(
            ChannelOptions::parse(&config, &["bufsz=lots"]),
            Err(ConsError::InvalidOption(_))
        ));
        assert!(ChannelOptions::parse(&config, &["line-buffered-ms=-5"]).is_err());
        assert!(ChannelOptions::parse(&config, &["key="]).is_err());
    }

    #[test]
    fn test_output_buf_size() {
        let config = ConsConfig::default();
        assert_eq!(config.output_buf_size(0), 40960);
        assert_eq!(config.output_buf_size(511), 40960);
        assert_eq!(config.output_buf_size(512), 512);
        assert_eq!(config.output_buf_size(usize::MAX), MAX_OBUF_SIZE);

        let tiny = ConsConfig {
            default_obuf_size: 16,
            ..ConsConfig::default()
        };
        assert_eq!(tiny.output_buf_size(0), MIN_OBUF_SIZE);
    }

    #[test]
    fn test_colors() {
        assert_eq!(Color::from_name("").unwrap(), Color::DEFAULT);
        assert_eq!(Color::from_name("r").unwrap().value(), 1);
        assert_eq!(Color::from_name("G").unwrap().value(), 10);
        assert_eq!(Color::from_name("white").unwrap().value(), 7);
        assert!(Color::from_name("x").is_err());

        assert_eq!("12".parse::<Color>().unwrap().value(), 12);
        assert!("16".parse::<Color>().is_err());
        assert!("c".parse::<Color>().is_ok());
    }

    #[test]
    fn test_color_spec() {
        assert_eq!(ColorSpec::resolve(None).unwrap(), Color::DEFAULT);
        let name = ColorSpec::Name("Y".into());
        assert_eq!(ColorSpec::resolve(Some(&name)).unwrap().value(), 11);
        assert_eq!(ColorSpec::resolve(Some(&ColorSpec::Value(4))).unwrap().value(), 4);
        assert!(ColorSpec::resolve(Some(&ColorSpec::Value(-1))).is_err());
        assert!(ColorSpec::resolve(Some(&ColorSpec::Value(16))).is_err());
    }

    #[test]
    fn test_color_ansi() {
        assert_eq!(Color::new(1).unwrap().ansi(), "\x1b[31m");
        assert_eq!(Color::new(12).unwrap().ansi(), "\x1b[1;34m");
    }

    #[test]
    fn test_partial_toml_manifest() {
        let config = ConsConfig::from_toml_str(
            "default_show_all = true\ndefault_line_buffering_ms = 20\n",
        )
        .unwrap();
        assert!(config.default_show_all);
        assert_eq!(config.default_line_buffering_ms, 20);
        assert_eq!(config.default_obuf_size, 40960);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ConsConfig {
            default_timestamp: true,
            max_objects: 8,
            ..ConsConfig::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(ConsConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            ConsConfig::from_toml_str("max_objects = \"many\""),
            Err(ConsError::Config(_))
        ));
    }
}
