use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pipeline::Toolchain;

/// AWS F1 build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum F1Mode {
    SwEmu,
    HwEmu,
    Hw,
}

impl F1Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            F1Mode::SwEmu => "sw_emu",
            F1Mode::HwEmu => "hw_emu",
            F1Mode::Hw => "hw",
        }
    }
}

impl fmt::Display for F1Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for F1Mode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sw_emu" => Ok(F1Mode::SwEmu),
            "hw_emu" => Ok(F1Mode::HwEmu),
            "hw" => Ok(F1Mode::Hw),
            other => Err(PipelineError::InvalidConfig(format!(
                "mode must be one of sw_emu, hw_emu, hw (got '{}')",
                other
            ))),
        }
    }
}

const COMMON_KEYS: &[&str] = &["estimate", "skipexec", "make", "directives", "hwname"];
const SDSOC_KEYS: &[&str] = &["platform"];
const F1_KEYS: &[&str] = &["mode"];

/// Typed view of a job's free-form config map, validated against the
/// option schema of its toolchain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Stop after a resource estimate instead of a full build.
    pub estimate: bool,
    pub skipexec: bool,
    /// Build with the job's own Makefile instead of the built-in commands.
    pub make: bool,
    pub directives: Option<String>,
    pub hwname: Option<String>,
    pub platform: Option<String>,
    /// Always set for f1 jobs, never for sdsoc jobs.
    pub mode: Option<F1Mode>,
}

impl JobOptions {
    pub fn parse(
        toolchain: Toolchain,
        config: &BTreeMap<String, String>,
        default_mode: F1Mode,
    ) -> Result<Self> {
        let specific = match toolchain {
            Toolchain::Sdsoc => SDSOC_KEYS,
            Toolchain::F1 => F1_KEYS,
        };
        if let Some(key) = config
            .keys()
            .find(|k| !COMMON_KEYS.contains(&k.as_str()) && !specific.contains(&k.as_str()))
        {
            return Err(PipelineError::InvalidConfig(format!(
                "unknown option '{}' for toolchain {}",
                key, toolchain
            )));
        }

        let text = |key: &str| {
            config
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        let options = Self {
            estimate: parse_flag(config, "estimate")?,
            skipexec: parse_flag(config, "skipexec")?,
            make: parse_flag(config, "make")?,
            directives: text("directives"),
            hwname: text("hwname"),
            platform: text("platform"),
            mode: match toolchain {
                Toolchain::F1 => Some(match text("mode") {
                    Some(mode) => mode.parse()?,
                    None => default_mode,
                }),
                Toolchain::Sdsoc => None,
            },
        };

        if !options.make && options.hwname.is_none() {
            return Err(PipelineError::InvalidConfig(
                "hwname is required unless the job builds with its own Makefile".to_string(),
            ));
        }
        if options.estimate && options.mode == Some(F1Mode::Hw) {
            return Err(PipelineError::InvalidConfig(
                "estimate conflicts with mode=hw".to_string(),
            ));
        }
        Ok(options)
    }

    /// Record resolved defaults in the job's config so every worker sees
    /// the same values the stage sequence was derived from.
    pub fn apply_defaults(&self, config: &mut BTreeMap<String, String>) {
        if let Some(mode) = self.mode {
            config.insert("mode".to_string(), mode.to_string());
        }
    }
}

fn parse_flag(config: &BTreeMap<String, String>, key: &str) -> Result<bool> {
    let Some(raw) = config.get(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        _ => Err(PipelineError::InvalidConfig(format!(
            "option '{}' expects a boolean, got '{}'",
            key, raw
        ))),
    }
}
