// src/config.rs - runtime configuration (CLI + JSON file)
use crate::audio::AudioType;
use crate::kob::InterfaceType;
use crate::morse::{CodeType, Spacing};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The example config is embedded directly in the binary at compile time.
/// Users can write it out with:  kobwire --write-config
pub const DEFAULT_CONFIG_JSON: &str = include_str!("../config.json.example");

// ── CLI ───────────────────────────────────────────────────────────────────────
#[derive(Parser, Debug)]
#[command(
    name = "kobwire",
    about = "Morse Receive & Transmit over a KOB wire",
    version
)]
pub struct Cli {
    /// Config file path (default: ~/.config/kobwire/config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Wire to connect to (overrides the configured wire)
    pub wire: Option<u16>,

    /// Station/Office ID to attach with
    #[arg(long)]
    pub station: Option<String>,

    /// Text speed in WPM (Farnsworth effective speed)
    #[arg(short = 't', long)]
    pub text_speed: Option<u16>,

    /// Minimum character speed in WPM
    #[arg(long)]
    pub char_speed: Option<u16>,

    /// Farnsworth spacing placement: none | char | word
    #[arg(long)]
    pub spacing: Option<Spacing>,

    /// Code type: american | international
    #[arg(long)]
    pub code_type: Option<CodeType>,

    /// Follow the detected sender speed in the decoder
    #[arg(long, action)]
    pub decode_at_detected: bool,

    /// KOB server host[:port]
    #[arg(long)]
    pub server_url: Option<String>,

    /// Serial port for the key/sounder interface (e.g. /dev/ttyUSB0, COM3)
    #[arg(short = 'p', long)]
    pub serial_port: Option<String>,

    /// Use the GPIO key/sounder interface (Raspberry Pi)
    #[arg(long, action)]
    pub gpio: bool,

    /// Interface type: loop | key-sounder | keyer
    #[arg(long)]
    pub interface_type: Option<InterfaceType>,

    /// Invert the raw key input sense (used with modem adapters)
    #[arg(long, action)]
    pub invert_key_input: bool,

    /// The physical key has no closer; track the closer in software
    #[arg(long, action)]
    pub no_key_closer: bool,

    /// Enable/disable the synth sounder (true/false)
    #[arg(long)]
    pub sound: Option<bool>,

    /// Enable/disable the physical sounder (true/false)
    #[arg(long)]
    pub sounder: Option<bool>,

    /// Sounder power-save idle cutoff in seconds (0 disables)
    #[arg(long)]
    pub power_save: Option<u32>,

    /// Synth voice: sounder | tone
    #[arg(long)]
    pub audio_type: Option<AudioType>,

    /// Tone frequency in Hz (tone voice)
    #[arg(long)]
    pub tone: Option<u32>,

    /// Connect to the configured wire at startup
    #[arg(long, action)]
    pub auto_connect: bool,

    /// Record the session to a file (generated name when none is given)
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub record: Option<String>,

    /// Play back a recording instead of connecting the key
    #[arg(long)]
    pub play: Option<PathBuf>,

    /// Clamp recorded silences to this many seconds during playback
    #[arg(long, default_value_t = 5)]
    pub max_silence: u32,

    /// Playback speed factor in percent (100 = recorded speed)
    #[arg(long, default_value_t = 100)]
    pub speed_factor: u32,

    /// List recording information before playing
    #[arg(long, action)]
    pub list: bool,

    /// List available serial ports and exit
    #[arg(long, action)]
    pub list_ports: bool,

    /// Fail (exit code 2) when the hardware interface cannot be initialized
    #[arg(long, action)]
    pub require_hardware: bool,

    /// Write the built-in default config to the config path and exit
    #[arg(long, action)]
    pub write_config: bool,

    /// Print the built-in default config to stdout and exit
    #[arg(long, action)]
    pub print_config: bool,
}

// ── JSON file structure ───────────────────────────────────────────────────────
// Flat object; every key optional so partial configs merge over defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    pub audio_type: Option<AudioType>,
    pub use_gpio: Option<bool>,
    pub use_serial: Option<bool>,
    pub serial_port: Option<String>,
    pub interface_type: Option<InterfaceType>,
    pub invert_key_input: Option<bool>,
    pub no_key_closer: Option<bool>,
    pub sound: Option<bool>,
    pub sounder: Option<bool>,
    pub sounder_power_save: Option<u32>,
    pub code_type: Option<CodeType>,
    pub decode_at_detected: Option<bool>,
    pub min_char_speed: Option<u16>,
    pub text_speed: Option<u16>,
    pub spacing: Option<Spacing>,
    pub auto_connect: Option<bool>,
    pub local: Option<bool>,
    pub remote: Option<bool>,
    pub server_url: Option<String>,
    pub station: Option<String>,
    pub wire: Option<u16>,
    pub logging_level: Option<String>,
    pub tone: Option<u32>,
    pub volume: Option<f32>,
}

// ── Change mask ───────────────────────────────────────────────────────────────
// Components inspect the mask to decide whether to rebind hardware, rebuild
// the encoder/decoder, or re-apply operational policy.
pub mod change_type {
    pub const NONE: u8 = 0;
    pub const OPERATIONS: u8 = 1;
    pub const MORSE: u8 = 2;
    pub const HARDWARE: u8 = 4;
    pub const ANY: u8 = OPERATIONS | MORSE | HARDWARE;
}

// ── Resolved / merged config ──────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub audio_type: AudioType,
    pub use_gpio: bool,
    pub use_serial: bool,
    pub serial_port: String,
    pub interface_type: InterfaceType,
    pub invert_key_input: bool,
    pub no_key_closer: bool,
    /// Synth sounder enabled.
    pub sound: bool,
    /// Physical sounder enabled.
    pub sounder: bool,
    /// Idle cutoff in seconds; 0 disables power-save.
    pub sounder_power_save: u32,
    pub code_type: CodeType,
    pub decode_at_detected: bool,
    pub min_char_speed: u16,
    pub text_speed: u16,
    pub spacing: Spacing,
    pub auto_connect: bool,
    /// Sound local transmissions.
    pub local: bool,
    /// Send local transmissions to the wire.
    pub remote: bool,
    pub server_url: String,
    pub station: String,
    pub wire: u16,
    pub logging_level: String,
    pub tone_hz: u32,
    pub volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio_type: AudioType::Sounder,
            use_gpio: false,
            use_serial: false,
            serial_port: String::new(),
            interface_type: InterfaceType::Loop,
            invert_key_input: false,
            no_key_closer: false,
            sound: true,
            sounder: false,
            sounder_power_save: 60,
            code_type: CodeType::American,
            decode_at_detected: false,
            min_char_speed: 18,
            text_speed: 18,
            spacing: Spacing::None,
            auto_connect: false,
            local: true,
            remote: true,
            server_url: "mtc-kob.dyndns.org:7890".into(),
            station: "kobwire office".into(),
            wire: 101,
            logging_level: "info".into(),
            tone_hz: 620,
            volume: 0.7,
        }
    }
}

impl Config {
    /// Write the embedded default config to disk. Returns the path used.
    pub fn write_default_config(cli: &Cli) -> Result<PathBuf> {
        let path = cli.config.clone().unwrap_or_else(default_config_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Creating config directory {parent:?}"))?;
        }
        std::fs::write(&path, DEFAULT_CONFIG_JSON)
            .with_context(|| format!("Writing config to {path:?}"))?;
        Ok(path)
    }

    pub fn load(cli: &Cli) -> Result<Self> {
        let mut cfg = Self::default();
        let path = cli.config.clone().unwrap_or_else(default_config_path);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Reading config {path:?}"))?;
            let fc: FileConfig =
                serde_json::from_str(&raw).with_context(|| format!("Parsing config {path:?}"))?;
            cfg.apply_file(&fc);
        } else {
            log::info!(
                "no config file at {}; using defaults (run `kobwire --write-config` to create one)",
                path.display()
            );
        }
        cfg.apply_cli(cli);
        Ok(cfg)
    }

    pub fn apply_file(&mut self, fc: &FileConfig) {
        if let Some(v) = fc.audio_type {
            self.audio_type = v;
        }
        if let Some(v) = fc.use_gpio {
            self.use_gpio = v;
        }
        if let Some(v) = fc.use_serial {
            self.use_serial = v;
        }
        if let Some(v) = &fc.serial_port {
            self.serial_port = v.clone();
        }
        if let Some(v) = fc.interface_type {
            self.interface_type = v;
        }
        if let Some(v) = fc.invert_key_input {
            self.invert_key_input = v;
        }
        if let Some(v) = fc.no_key_closer {
            self.no_key_closer = v;
        }
        if let Some(v) = fc.sound {
            self.sound = v;
        }
        if let Some(v) = fc.sounder {
            self.sounder = v;
        }
        if let Some(v) = fc.sounder_power_save {
            self.sounder_power_save = v;
        }
        if let Some(v) = fc.code_type {
            self.code_type = v;
        }
        if let Some(v) = fc.decode_at_detected {
            self.decode_at_detected = v;
        }
        if let Some(v) = fc.min_char_speed {
            self.min_char_speed = v;
        }
        if let Some(v) = fc.text_speed {
            self.text_speed = v;
        }
        if let Some(v) = fc.spacing {
            self.spacing = v;
        }
        if let Some(v) = fc.auto_connect {
            self.auto_connect = v;
        }
        if let Some(v) = fc.local {
            self.local = v;
        }
        if let Some(v) = fc.remote {
            self.remote = v;
        }
        if let Some(v) = &fc.server_url {
            self.server_url = v.clone();
        }
        if let Some(v) = &fc.station {
            self.station = v.clone();
        }
        if let Some(v) = fc.wire {
            self.wire = v;
        }
        if let Some(v) = &fc.logging_level {
            self.logging_level = v.clone();
        }
        if let Some(v) = fc.tone {
            self.tone_hz = v;
        }
        if let Some(v) = fc.volume {
            self.volume = v;
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(v) = cli.wire {
            self.wire = v;
        }
        if let Some(v) = &cli.station {
            self.station = v.clone();
        }
        if let Some(v) = cli.text_speed {
            self.text_speed = v;
        }
        if let Some(v) = cli.char_speed {
            self.min_char_speed = v;
        }
        if let Some(v) = cli.spacing {
            self.spacing = v;
        }
        if let Some(v) = cli.code_type {
            self.code_type = v;
        }
        if cli.decode_at_detected {
            self.decode_at_detected = true;
        }
        if let Some(v) = &cli.server_url {
            self.server_url = v.clone();
        }
        if let Some(v) = &cli.serial_port {
            self.serial_port = v.clone();
            self.use_serial = true;
        }
        if cli.gpio {
            self.use_gpio = true;
        }
        if let Some(v) = cli.interface_type {
            self.interface_type = v;
        }
        if cli.invert_key_input {
            self.invert_key_input = true;
        }
        if cli.no_key_closer {
            self.no_key_closer = true;
        }
        if let Some(v) = cli.sound {
            self.sound = v;
        }
        if let Some(v) = cli.sounder {
            self.sounder = v;
        }
        if let Some(v) = cli.power_save {
            self.sounder_power_save = v;
        }
        if let Some(v) = cli.audio_type {
            self.audio_type = v;
        }
        if let Some(v) = cli.tone {
            self.tone_hz = v;
        }
        if cli.auto_connect {
            self.auto_connect = true;
        }
    }

    /// Which aspects changed relative to `other` (see [`change_type`]).
    pub fn changes_from(&self, other: &Config) -> u8 {
        let mut ct = change_type::NONE;
        if self.use_gpio != other.use_gpio
            || self.use_serial != other.use_serial
            || self.serial_port != other.serial_port
            || self.interface_type != other.interface_type
            || self.invert_key_input != other.invert_key_input
            || self.sound != other.sound
            || self.sounder != other.sounder
            || self.audio_type != other.audio_type
            || self.tone_hz != other.tone_hz
            || self.volume != other.volume
            || self.sounder_power_save != other.sounder_power_save
        {
            ct |= change_type::HARDWARE;
        }
        if self.code_type != other.code_type
            || self.decode_at_detected != other.decode_at_detected
            || self.min_char_speed != other.min_char_speed
            || self.text_speed != other.text_speed
            || self.spacing != other.spacing
        {
            ct |= change_type::MORSE;
        }
        if self.auto_connect != other.auto_connect
            || self.local != other.local
            || self.remote != other.remote
            || self.server_url != other.server_url
            || self.station != other.station
            || self.wire != other.wire
            || self.no_key_closer != other.no_key_closer
            || self.logging_level != other.logging_level
        {
            ct |= change_type::OPERATIONS;
        }
        ct
    }
}

fn default_config_path() -> PathBuf {
    config_dir().join("kobwire").join("config.json")
}

fn config_dir() -> PathBuf {
    if let Ok(v) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("APPDATA") {
        return PathBuf::from(v);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();
    PathBuf::from(home).join(".config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_default_config_parses_to_defaults() {
        let fc: FileConfig = serde_json::from_str(DEFAULT_CONFIG_JSON).unwrap();
        let mut cfg = Config::default();
        cfg.apply_file(&fc);
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_file_overrides_merge() {
        let fc: FileConfig =
            serde_json::from_str(r#"{"wire": 7, "code_type": "INTERNATIONAL"}"#).unwrap();
        let mut cfg = Config::default();
        cfg.apply_file(&fc);
        assert_eq!(cfg.wire, 7);
        assert_eq!(cfg.code_type, CodeType::International);
        assert_eq!(cfg.station, Config::default().station);
    }

    #[test]
    fn change_mask_classifies_keys() {
        let base = Config::default();
        let mut hw = base.clone();
        hw.serial_port = "/dev/ttyUSB0".into();
        assert_eq!(hw.changes_from(&base), change_type::HARDWARE);
        let mut morse = base.clone();
        morse.text_speed = 25;
        assert_eq!(morse.changes_from(&base), change_type::MORSE);
        let mut ops = base.clone();
        ops.wire = 19;
        assert_eq!(ops.changes_from(&base), change_type::OPERATIONS);
        assert_eq!(base.changes_from(&base), change_type::NONE);
    }
}
