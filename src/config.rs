//! Run-time configuration.
//!
//! The file dialect is a `[global]` section followed by optional per-device
//! sections, `key value` lines, `#` comments. Device sections inherit the
//! global values seen above them.

use std::collections::HashMap;
use std::path::Path;

use crate::phc::Polarity;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("line {line}: unrecognized option {key}")]
    UnknownOption { line: usize, key: String },
    #[error("line {line}: invalid value for {key}")]
    InvalidValue { line: usize, key: String },
    #[error("line {line}: expected `key value` or `[section]`")]
    Malformed { line: usize },
}

/// Per-slave device settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveOptions {
    /// Index of the pin wired to the PPS input.
    pub pin_index: u32,
    /// EXTTS channel the pin is multiplexed onto.
    pub channel: u32,
    pub polarity: Polarity,
    /// Width of the reference pulse. Zero disables the dual-edge filter.
    pub pulsewidth_ns: u32,
}

impl Default for SlaveOptions {
    fn default() -> Self {
        SlaveOptions {
            pin_index: 0,
            channel: 1,
            polarity: Polarity::RISING,
            pulsewidth_ns: 0,
        }
    }
}

/// Message routing settings, consumed by the frontend when it initializes the
/// logger. The library itself only emits through the `log` facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub verbose: bool,
    pub use_syslog: bool,
    /// Maximum severity that gets through, in syslog numbering (6 = info).
    pub level: u32,
    pub message_tag: Option<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            verbose: false,
            use_syslog: true,
            level: 6,
            message_tag: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    global: SlaveOptions,
    pub log: LogOptions,
    /// Period of the reference PHC's periodic output, in seconds. Hardware
    /// like the i210 timestamps both of its own output edges; a 2 s period
    /// keeps one captured edge per second there.
    pub perout_period_s: u32,
    sections: HashMap<String, SlaveOptions>,
}

impl Config {
    pub fn new() -> Self {
        Config {
            global: SlaveOptions::default(),
            log: LogOptions::default(),
            perout_period_s: 1,
            sections: HashMap::new(),
        }
    }

    /// Load a configuration file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parse configuration text. Errors carry the offending line number and
    /// are fatal to setup.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        let mut section: Option<String> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(name) = trimmed.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or(ConfigError::Malformed { line })?
                    .trim();
                if name.eq_ignore_ascii_case("global") {
                    section = None;
                } else {
                    config
                        .sections
                        .entry(name.to_string())
                        .or_insert(config.global);
                    section = Some(name.to_string());
                }
                continue;
            }

            let (key, value) = trimmed
                .split_once(char::is_whitespace)
                .ok_or(ConfigError::Malformed { line })?;
            let value = value.trim();

            match &section {
                None => config.apply_global(key, value, line)?,
                Some(name) => {
                    let options = config
                        .sections
                        .entry(name.clone())
                        .or_insert(config.global);
                    apply_slave_option(options, key, value, line)?
                }
            }
        }

        Ok(config)
    }

    fn apply_global(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "verbose" => self.log.verbose = parse_flag(key, value, line)?,
            "use_syslog" => self.log.use_syslog = parse_flag(key, value, line)?,
            "logging_level" => self.log.level = parse_number(key, value, line)?,
            "message_tag" => self.log.message_tag = Some(value.to_string()),
            "ts2phc.perout_period" => self.perout_period_s = parse_number(key, value, line)?,
            _ => apply_slave_option(&mut self.global, key, value, line)?,
        }
        Ok(())
    }

    /// Settings for one slave device: its section if present, the global
    /// values otherwise.
    pub fn slave_options(&self, device: &str) -> SlaveOptions {
        self.sections.get(device).copied().unwrap_or(self.global)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_slave_option(
    options: &mut SlaveOptions,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    match key {
        "ts2phc.pin_index" => options.pin_index = parse_number(key, value, line)?,
        "ts2phc.extts_index" => options.channel = parse_number(key, value, line)?,
        "ts2phc.extts_polarity" => {
            options.polarity = match value {
                "rising" => Polarity::RISING,
                "falling" => Polarity::FALLING,
                "both" => Polarity::RISING | Polarity::FALLING,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        line,
                        key: key.to_string(),
                    })
                }
            }
        }
        "ts2phc.pulsewidth" => options.pulsewidth_ns = parse_number(key, value, line)?,
        _ => {
            return Err(ConfigError::UnknownOption {
                line,
                key: key.to_string(),
            })
        }
    }
    Ok(())
}

fn parse_number(key: &str, value: &str, line: usize) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.to_string(),
    })
}

fn parse_flag(key: &str, value: &str, line: usize) -> Result<bool, ConfigError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ConfigError::InvalidValue {
            line,
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new();
        let options = config.slave_options("eth0");
        assert_eq!(options.pin_index, 0);
        assert_eq!(options.channel, 1);
        assert_eq!(options.polarity, Polarity::RISING);
        assert_eq!(options.pulsewidth_ns, 0);
        assert_eq!(config.perout_period_s, 1);
        assert!(config.log.use_syslog);
        assert_eq!(config.log.level, 6);
    }

    #[test]
    fn global_section_overrides_defaults() {
        let config = Config::parse(
            "[global]\n\
             ts2phc.extts_index 2\n\
             ts2phc.pulsewidth 200000000\n\
             logging_level 7\n\
             verbose 1\n",
        )
        .unwrap();
        let options = config.slave_options("eth0");
        assert_eq!(options.channel, 2);
        assert_eq!(options.pulsewidth_ns, 200_000_000);
        assert_eq!(config.log.level, 7);
        assert!(config.log.verbose);
    }

    #[test]
    fn device_section_inherits_globals() {
        let config = Config::parse(
            "[global]\n\
             ts2phc.pin_index 1\n\
             [eth0]\n\
             ts2phc.extts_polarity both\n",
        )
        .unwrap();

        let eth0 = config.slave_options("eth0");
        assert_eq!(eth0.pin_index, 1);
        assert!(eth0.polarity.is_both_edges());

        // devices without a section get the global values
        let eth1 = config.slave_options("eth1");
        assert_eq!(eth1.pin_index, 1);
        assert_eq!(eth1.polarity, Polarity::RISING);
    }

    #[test]
    fn perout_period_is_configurable() {
        let config = Config::parse("ts2phc.perout_period 2\n").unwrap();
        assert_eq!(config.perout_period_s, 2);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let config = Config::parse("# comment\n\n   \nmessage_tag steer-a\n").unwrap();
        assert_eq!(config.log.message_tag.as_deref(), Some("steer-a"));
    }

    #[test]
    fn unknown_key_is_rejected_with_line_number() {
        let err = Config::parse("\nts2phc.bogus 1\n").unwrap_err();
        match err {
            ConfigError::UnknownOption { line, key } => {
                assert_eq!(line, 2);
                assert_eq!(key, "ts2phc.bogus");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bad_polarity_is_rejected() {
        let err = Config::parse("ts2phc.extts_polarity sideways\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { line: 1, .. }));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let err = Config::parse("justakey\n").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 1 }));
    }
}
