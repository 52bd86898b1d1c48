// Configuration loading and validation

use crate::error::ConfigError;
use crate::matcher::MatchPredicate;
use crate::process::ProcessAttribute;
use crate::rate::Rate;
use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

pub const GLOBAL_MINIMUM_DOWNLOAD_RATE: Rate = Rate::from_bits_per_sec(100_000);
pub const GLOBAL_MINIMUM_UPLOAD_RATE: Rate = Rate::from_bits_per_sec(10_000);
pub const MINIMUM_DOWNLOAD_RATE: Rate = Rate::from_bits_per_sec(10_000);
pub const MINIMUM_UPLOAD_RATE: Rate = Rate::from_bits_per_sec(1_000);

/// Leaf class ids are allocated from a fixed 16-bit window
pub const MAX_RULES: usize = 4000;

/// Traffic direction, as seen from the shaped host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Download, Direction::Upload];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Rate, guarantee and priority settings for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionLimits {
    /// Ceiling; `None` means unconstrained
    pub rate: Option<Rate>,
    /// Guaranteed minimum
    pub minimum: Rate,
    /// Explicitly declared priority, lower is served first
    pub priority: Option<u32>,
}

/// A named set of processes sharing one traffic class per direction
#[derive(Debug, Clone)]
pub struct Rule {
    pub label: String,
    pub predicates: Vec<MatchPredicate>,
    pub download: DirectionLimits,
    pub upload: DirectionLimits,
    /// Include every descendant of a matching process
    pub recursive: bool,
}

impl Rule {
    pub fn limits(&self, direction: Direction) -> &DirectionLimits {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }
}

/// Validated configuration for one shaped interface
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub interface: String,
    pub download: DirectionLimits,
    pub upload: DirectionLimits,
    /// Rules in declaration order; earlier rules win overlapping matches
    pub rules: Vec<Rule>,
}

impl GlobalConfig {
    /// Load and validate a YAML configuration file
    pub fn load(interface: &str, path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml_str(interface, &contents)?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_yaml_str(interface: &str, contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = if contents.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        raw.validate(interface)
    }

    pub fn limits(&self, direction: Direction) -> &DirectionLimits {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    /// Replace the global ceilings, e.g. with measured line speeds
    pub fn with_global_rates(mut self, download: Option<Rate>, upload: Option<Rate>) -> Self {
        if download.is_some() {
            self.download.rate = download;
        }
        if upload.is_some() {
            self.upload.rate = upload;
        }
        self
    }
}

#[cfg(test)]
impl GlobalConfig {
    pub fn rule(&self, label: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.label == label)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    download: Option<RawRate>,
    upload: Option<RawRate>,
    download_minimum: Option<RawRate>,
    upload_minimum: Option<RawRate>,
    download_priority: Option<u32>,
    upload_priority: Option<u32>,
    #[serde(default)]
    processes: Option<IndexMap<String, RawRule>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRule {
    download: Option<RawRate>,
    upload: Option<RawRate>,
    download_minimum: Option<RawRate>,
    upload_minimum: Option<RawRate>,
    download_priority: Option<u32>,
    upload_priority: Option<u32>,
    #[serde(default)]
    recursive: bool,
    #[serde(default, rename = "match")]
    conditions: Option<Vec<IndexMap<String, RawPattern>>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRate {
    Bits(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPattern {
    Integer(i64),
    Text(String),
}

impl RawRate {
    fn resolve(&self) -> Result<Rate, ConfigError> {
        match self {
            RawRate::Bits(bits) => Ok(Rate::from_bits_per_sec(*bits)),
            RawRate::Text(text) => Rate::parse(text),
        }
    }
}

fn resolve_optional(rate: &Option<RawRate>) -> Result<Option<Rate>, ConfigError> {
    rate.as_ref().map(RawRate::resolve).transpose()
}

fn resolve_minimum(rate: &Option<RawRate>, default: Rate) -> Result<Rate, ConfigError> {
    Ok(resolve_optional(rate)?.unwrap_or(default))
}

impl RawConfig {
    fn validate(self, interface: &str) -> Result<GlobalConfig, ConfigError> {
        let download = DirectionLimits {
            rate: resolve_optional(&self.download)?,
            minimum: resolve_minimum(&self.download_minimum, GLOBAL_MINIMUM_DOWNLOAD_RATE)?,
            priority: self.download_priority,
        };
        let upload = DirectionLimits {
            rate: resolve_optional(&self.upload)?,
            minimum: resolve_minimum(&self.upload_minimum, GLOBAL_MINIMUM_UPLOAD_RATE)?,
            priority: self.upload_priority,
        };

        let mut rules = Vec::new();
        for (label, raw_rule) in self.processes.unwrap_or_default() {
            if let Some(rule) = raw_rule.validate(label)? {
                rules.push(rule);
            }
        }

        if rules.len() > MAX_RULES {
            return Err(ConfigError::TooManyRules {
                count: rules.len(),
                max: MAX_RULES,
            });
        }

        Ok(GlobalConfig {
            interface: interface.to_string(),
            download,
            upload,
            rules,
        })
    }
}

impl RawRule {
    fn validate(self, label: String) -> Result<Option<Rule>, ConfigError> {
        let conditions = self.conditions.unwrap_or_default();
        if conditions.is_empty() {
            log::warn!("No conditions for {:?} specified, it will never be matched", label);
            return Ok(None);
        }

        let mut predicates = Vec::with_capacity(conditions.len());
        for condition in conditions {
            if condition.len() != 1 {
                return Err(ConfigError::MalformedPredicate {
                    rule: label,
                    found: condition.len(),
                });
            }

            for (attribute_name, pattern) in condition {
                let attribute = attribute_name.parse::<ProcessAttribute>().map_err(|_| {
                    ConfigError::UnknownAttribute {
                        rule: label.clone(),
                        attribute: attribute_name.clone(),
                    }
                })?;

                let pattern = match pattern {
                    RawPattern::Integer(value) => value.to_string(),
                    RawPattern::Text(text) => text,
                };

                let predicate = MatchPredicate::new(attribute, &pattern).map_err(|source| {
                    ConfigError::InvalidPattern {
                        rule: label.clone(),
                        attribute: attribute_name.clone(),
                        source,
                    }
                })?;
                predicates.push(predicate);
            }
        }

        Ok(Some(Rule {
            download: DirectionLimits {
                rate: resolve_optional(&self.download)?,
                minimum: resolve_minimum(&self.download_minimum, MINIMUM_DOWNLOAD_RATE)?,
                priority: self.download_priority,
            },
            upload: DirectionLimits {
                rate: resolve_optional(&self.upload)?,
                minimum: resolve_minimum(&self.upload_minimum, MINIMUM_UPLOAD_RATE)?,
                priority: self.upload_priority,
            },
            label,
            predicates,
            recursive: self.recursive,
        }))
    }
}
