//! What the engine should taint and how hard it should look.
//!
//! A [`Config`] can be built in code, read from JSON, or picked up from
//! `TAINTHEAP_*` environment variables (the only option when we are preloaded
//! into a program we do not control):
//!
//! | variable | field |
//! |---|---|
//! | `TAINTHEAP_TAINT_STRING` | `taint_string` |
//! | `TAINTHEAP_FILE_FILTER` | `file_filter` |
//! | `TAINTHEAP_TAINT_SOURCES` | `taint_network`/`taint_file`/`taint_stdin`, as letters `nfs` |
//! | `TAINTHEAP_FREELIST_VOL` | `freelist_vol` |
//! | `TAINTHEAP_VERBOSITY` | `verbosity` |
//! | `TAINTHEAP_LEAK_CHECK` | `leak_check` (`off`, `summary`, `full`) |
//! | `TAINTHEAP_REDZONE` | `malloc_redzone` |
//! | `TAINTHEAP_ALIGNMENT` | `alignment` |
//! | `TAINTHEAP_POISON_FREED` | `poison_freed` |
//! | `TAINTHEAP_PARANOID_POOLS` | `paranoid_pools` |

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// How much work a leak check does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakCheckMode {
    /// Don't scan at all.
    Off,
    /// Totals per reachedness class.
    #[default]
    Summary,
    /// Totals plus one loss record per allocation site.
    Full,
}

impl FromStr for LeakCheckMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "no" => Ok(LeakCheckMode::Off),
            "summary" => Ok(LeakCheckMode::Summary),
            "full" | "yes" => Ok(LeakCheckMode::Full),
            _ => Err(ConfigError::InvalidValue {
                var: "leak_check".to_owned(),
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bytes equal to this string are tainted wherever they are read.
    pub taint_string: Option<String>,
    /// Files whose path starts with this are taint sources. Empty matches
    /// every file.
    pub file_filter: String,
    pub taint_stdin: bool,
    pub taint_network: bool,
    pub taint_file: bool,
    /// Quarantine budget in bytes.
    pub freelist_vol: usize,
    pub verbosity: u8,
    pub leak_check: LeakCheckMode,
    /// Redzone on each side of `malloc()`-family blocks.
    pub malloc_redzone: usize,
    /// Alignment of `malloc()`-family blocks.
    pub alignment: usize,
    /// Keep freed blocks no-access for as long as they are quarantined.
    pub poison_freed: bool,
    /// Check pool consistency after every pool operation regardless of
    /// verbosity.
    pub paranoid_pools: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            taint_string: None,
            file_filter: String::new(),
            taint_stdin: false,
            taint_network: false,
            taint_file: false,
            freelist_vol: 20_000_000,
            verbosity: 1,
            leak_check: LeakCheckMode::Summary,
            malloc_redzone: 16,
            alignment: 8,
            poison_freed: false,
            paranoid_pools: false,
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum ConfigError {
    Json(serde_json::Error),
    UnknownTaintSource(char),
    InvalidNumber { var: String, value: String },
    InvalidValue { var: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Json(err) => write!(f, "bad configuration: {err}"),
            ConfigError::UnknownTaintSource(c) => {
                write!(f, "unknown taint source {c:?} (expected some of \"nfs\")")
            }
            ConfigError::InvalidNumber { var, value } => {
                write!(f, "{var}: {value:?} is not a valid number")
            }
            ConfigError::InvalidValue { var, value } => write!(f, "{var}: invalid value {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overridden by whatever `TAINTHEAP_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`Config::from_env`], with `lookup` standing in for the
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(s) = lookup("TAINTHEAP_TAINT_STRING") {
            config.taint_string = Some(s).filter(|s| !s.is_empty());
        }
        if let Some(s) = lookup("TAINTHEAP_FILE_FILTER") {
            config.file_filter = s;
        }
        if let Some(s) = lookup("TAINTHEAP_TAINT_SOURCES") {
            config.set_taint_sources(&s)?;
        }
        if let Some(n) = parse_var(&lookup, "TAINTHEAP_FREELIST_VOL")? {
            config.freelist_vol = n;
        }
        if let Some(n) = parse_var(&lookup, "TAINTHEAP_VERBOSITY")? {
            config.verbosity = n;
        }
        if let Some(s) = lookup("TAINTHEAP_LEAK_CHECK") {
            config.leak_check = s.parse().map_err(|_| ConfigError::InvalidValue {
                var: "TAINTHEAP_LEAK_CHECK".to_owned(),
                value: s.clone(),
            })?;
        }
        if let Some(n) = parse_var(&lookup, "TAINTHEAP_REDZONE")? {
            config.malloc_redzone = n;
        }
        if let Some(n) = parse_var(&lookup, "TAINTHEAP_ALIGNMENT")? {
            config.alignment = n;
        }
        if let Some(b) = flag_var(&lookup, "TAINTHEAP_POISON_FREED")? {
            config.poison_freed = b;
        }
        if let Some(b) = flag_var(&lookup, "TAINTHEAP_PARANOID_POOLS")? {
            config.paranoid_pools = b;
        }
        config.validate()?;
        Ok(config)
    }

    /// Enable exactly the taint sources named by `sources`: `n` for the
    /// network, `f` for files, `s` for stdin.
    pub fn set_taint_sources(&mut self, sources: &str) -> Result<(), ConfigError> {
        let (mut network, mut file, mut stdin) = (false, false, false);
        for c in sources.chars() {
            match c {
                'n' => network = true,
                'f' => file = true,
                's' => stdin = true,
                other => return Err(ConfigError::UnknownTaintSource(other)),
            }
        }
        self.taint_network = network;
        self.taint_file = file;
        self.taint_stdin = stdin;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.alignment.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                var: "alignment".to_owned(),
                value: self.alignment.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidNumber {
            var: var.to_owned(),
            value,
        })
}

fn flag_var<F>(lookup: &F, var: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "" | "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            var: var.to_owned(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.freelist_vol, 20_000_000);
        assert_eq!(config.verbosity, 1);
        assert_eq!(config.leak_check, LeakCheckMode::Summary);
        assert!(!config.taint_network && !config.taint_file && !config.taint_stdin);
    }

    #[test]
    fn json_fills_in_missing_fields() {
        let config =
            Config::from_json_str(r#"{"taint_network": true, "leak_check": "full"}"#).unwrap();
        assert!(config.taint_network);
        assert_eq!(config.leak_check, LeakCheckMode::Full);
        assert_eq!(config.malloc_redzone, 16);
        assert!(matches!(
            Config::from_json_str(r#"{"verbosity": "loud"}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(Config::from_json_str(r#"{"alignment": 12}"#).is_err());
    }

    #[test]
    fn taint_sources_are_letters() {
        let mut config = Config::default();
        config.set_taint_sources("nf").unwrap();
        assert!(config.taint_network && config.taint_file && !config.taint_stdin);
        config.set_taint_sources("s").unwrap();
        assert!(!config.taint_network && !config.taint_file && config.taint_stdin);
        assert!(matches!(
            config.set_taint_sources("nx"),
            Err(ConfigError::UnknownTaintSource('x'))
        ));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("TAINTHEAP_TAINT_SOURCES", "fs"),
            ("TAINTHEAP_FILE_FILTER", "/tmp/"),
            ("TAINTHEAP_FREELIST_VOL", "4096"),
            ("TAINTHEAP_LEAK_CHECK", "off"),
            ("TAINTHEAP_POISON_FREED", "1"),
        ]))
        .unwrap();
        assert!(config.taint_file && config.taint_stdin && !config.taint_network);
        assert_eq!(config.file_filter, "/tmp/");
        assert_eq!(config.freelist_vol, 4096);
        assert_eq!(config.leak_check, LeakCheckMode::Off);
        assert!(config.poison_freed);

        assert!(matches!(
            Config::from_lookup(lookup(&[("TAINTHEAP_VERBOSITY", "lots")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
