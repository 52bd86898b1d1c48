// Line speed measurement through the `speedtest` command line tool
//
// Two incompatible tools install a `speedtest` binary: the official Ookla
// client and sivel's speedtest-cli. The flavor is detected from the version
// banner.

use crate::error::SpeedTestError;
use crate::rate::Rate;
use serde::Deserialize;
use tokio::process::Command;

const SPEEDTEST: &str = "speedtest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedTestProvider {
    /// https://www.speedtest.net/apps/cli
    Ookla,
    /// https://github.com/sivel/speedtest-cli
    Sivel,
}

impl SpeedTestProvider {
    pub fn detect(version_output: &str) -> Result<Self, SpeedTestError> {
        let banner = version_output.trim_start();
        if banner.starts_with("Speedtest by Ookla") {
            Ok(SpeedTestProvider::Ookla)
        } else if banner.starts_with("speedtest-cli") {
            Ok(SpeedTestProvider::Sivel)
        } else {
            Err(SpeedTestError::UnknownProvider(
                banner.lines().next().unwrap_or_default().to_string(),
            ))
        }
    }

    fn json_flag(&self) -> &'static str {
        match self {
            SpeedTestProvider::Ookla => "--format=json",
            SpeedTestProvider::Sivel => "--json",
        }
    }

    /// Extract both rates from the tool's JSON report
    pub fn parse(&self, output: &str) -> Result<SpeedTestResult, serde_json::Error> {
        match self {
            SpeedTestProvider::Ookla => {
                let report: OoklaReport = serde_json::from_str(output)?;
                // Ookla reports bytes per second
                Ok(SpeedTestResult {
                    download: Rate::from_bits_per_sec(report.download.bandwidth.saturating_mul(8)),
                    upload: Rate::from_bits_per_sec(report.upload.bandwidth.saturating_mul(8)),
                })
            }
            SpeedTestProvider::Sivel => {
                let report: SivelReport = serde_json::from_str(output)?;
                Ok(SpeedTestResult {
                    download: Rate::from_bits_per_sec(report.download.max(0.0).round() as u64),
                    upload: Rate::from_bits_per_sec(report.upload.max(0.0).round() as u64),
                })
            }
        }
    }
}

/// Measured line speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedTestResult {
    pub download: Rate,
    pub upload: Rate,
}

#[derive(Debug, Deserialize)]
struct OoklaReport {
    download: OoklaTransfer,
    upload: OoklaTransfer,
}

#[derive(Debug, Deserialize)]
struct OoklaTransfer {
    bandwidth: u64,
}

#[derive(Debug, Deserialize)]
struct SivelReport {
    download: f64,
    upload: f64,
}

async fn run(args: &[&str]) -> Result<String, SpeedTestError> {
    let command = std::iter::once(SPEEDTEST)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    log::debug!("Running: {}", command);

    let output = Command::new(SPEEDTEST)
        .args(args)
        .output()
        .await
        .map_err(SpeedTestError::MissingDependency)?;

    if !output.status.success() {
        return Err(SpeedTestError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Measure download and upload speed. Takes tens of seconds.
pub async fn test_speed() -> Result<SpeedTestResult, SpeedTestError> {
    let version = run(&["--version"]).await?;
    let provider = SpeedTestProvider::detect(&version)?;
    log::debug!("Detected {:?} speedtest client", provider);

    let flag = provider.json_flag();
    let output = run(&[flag]).await?;
    provider
        .parse(&output)
        .map_err(|source| SpeedTestError::Output {
            command: format!("{} {}", SPEEDTEST, flag),
            source,
        })
}
