//! Acquisition parameters for the ADC-24 data logger
//!
//! Defaults reproduce the fungal electrophysiology setup: differential input on
//! channel 1, ±39 mV range, 100 ms conversion (10 S/s) and 50 Hz mains rejection.

use crate::error::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Full-scale count of the 24-bit signed converter (2^23 - 1).
pub const ADC_MAX_COUNT: i32 = 8_388_607;

/// Highest analog input channel on the logger.
pub const MAX_CHANNEL: u8 = 16;

/// Input voltage range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoltageRange {
    Mv39,
    Mv78,
    Mv156,
    Mv312,
    Mv625,
    Mv1250,
    Mv2500,
}

impl VoltageRange {
    pub const ALL: [VoltageRange; 7] = [
        VoltageRange::Mv39,
        VoltageRange::Mv78,
        VoltageRange::Mv156,
        VoltageRange::Mv312,
        VoltageRange::Mv625,
        VoltageRange::Mv1250,
        VoltageRange::Mv2500,
    ];

    /// Range code understood by the driver
    pub fn code(self) -> i16 {
        match self {
            VoltageRange::Mv39 => 1,
            VoltageRange::Mv78 => 2,
            VoltageRange::Mv156 => 3,
            VoltageRange::Mv312 => 4,
            VoltageRange::Mv625 => 5,
            VoltageRange::Mv1250 => 6,
            VoltageRange::Mv2500 => 7,
        }
    }

    pub fn millivolts(self) -> f64 {
        match self {
            VoltageRange::Mv39 => 39.0,
            VoltageRange::Mv78 => 78.0,
            VoltageRange::Mv156 => 156.0,
            VoltageRange::Mv312 => 312.0,
            VoltageRange::Mv625 => 625.0,
            VoltageRange::Mv1250 => 1250.0,
            VoltageRange::Mv2500 => 2500.0,
        }
    }

    /// Convert a raw converter count to microvolts.
    pub fn counts_to_microvolts(self, raw: i32) -> f64 {
        (raw as f64 / ADC_MAX_COUNT as f64) * self.millivolts() * 1000.0
    }

    /// Inverse of [`counts_to_microvolts`](Self::counts_to_microvolts), clamped to the converter range.
    pub fn microvolts_to_counts(self, microvolts: f64) -> i32 {
        let counts = microvolts / (self.millivolts() * 1000.0) * ADC_MAX_COUNT as f64;
        counts.clamp(-(ADC_MAX_COUNT as f64), ADC_MAX_COUNT as f64) as i32
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        VoltageRange::Mv39
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "±{} mV", self.millivolts())
    }
}

impl FromStr for VoltageRange {
    type Err = StreamError;

    /// Accepts the millivolt figure ("39", "1250") or the serde name ("mv39").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let digits = trimmed.trim_start_matches("mv").trim_end_matches("mv").trim();
        VoltageRange::ALL
            .iter()
            .copied()
            .find(|r| format!("{}", r.millivolts() as u32) == digits)
            .ok_or_else(|| StreamError::InvalidConfig(format!("Unknown voltage range: {}", s)))
    }
}

/// Converter integration time per sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionTime {
    Ms60,
    Ms100,
    Ms180,
    Ms340,
    Ms660,
}

impl ConversionTime {
    pub fn code(self) -> i16 {
        match self {
            ConversionTime::Ms60 => 0,
            ConversionTime::Ms100 => 1,
            ConversionTime::Ms180 => 2,
            ConversionTime::Ms340 => 3,
            ConversionTime::Ms660 => 4,
        }
    }

    pub fn millis(self) -> u64 {
        match self {
            ConversionTime::Ms60 => 60,
            ConversionTime::Ms100 => 100,
            ConversionTime::Ms180 => 180,
            ConversionTime::Ms340 => 340,
            ConversionTime::Ms660 => 660,
        }
    }

    pub fn from_millis(millis: u64) -> StreamResult<Self> {
        [
            ConversionTime::Ms60,
            ConversionTime::Ms100,
            ConversionTime::Ms180,
            ConversionTime::Ms340,
            ConversionTime::Ms660,
        ]
        .into_iter()
        .find(|t| t.millis() == millis)
        .ok_or_else(|| {
            StreamError::InvalidConfig(format!(
                "Unsupported conversion time {} ms (60, 100, 180, 340 or 660)",
                millis
            ))
        })
    }
}

impl Default for ConversionTime {
    fn default() -> Self {
        ConversionTime::Ms100
    }
}

/// Configuration for a single analog input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel number (1-16)
    pub channel: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// False means differential input
    #[serde(default)]
    pub single_ended: bool,
    #[serde(default)]
    pub voltage_range: VoltageRange,
}

fn default_true() -> bool {
    true
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel: 1,
            enabled: true,
            single_ended: false,
            voltage_range: VoltageRange::Mv39,
        }
    }
}

/// Parameters applied to a sample source before streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub conversion_time: ConversionTime,
    /// True selects 50 Hz rejection, false 60 Hz
    #[serde(default = "default_true")]
    pub mains_rejection_50hz: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channels: vec![ChannelConfig::default()],
            conversion_time: ConversionTime::Ms100,
            mains_rejection_50hz: true,
        }
    }
}

impl AcquisitionConfig {
    /// Single-channel configuration, the common case for the dashboard.
    pub fn single(channel: u8, voltage_range: VoltageRange, differential: bool) -> Self {
        Self {
            channels: vec![ChannelConfig {
                channel,
                enabled: true,
                single_ended: !differential,
                voltage_range,
            }],
            ..Default::default()
        }
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Interval between sampling rounds across all enabled channels.
    pub fn sample_interval_ms(&self) -> u64 {
        let enabled = self.enabled_channels().count().max(1) as u64;
        self.conversion_time.millis() * enabled + 20
    }

    pub fn validate(&self) -> StreamResult<()> {
        let mut seen = HashSet::new();
        for ch in &self.channels {
            if ch.channel == 0 || ch.channel > MAX_CHANNEL {
                return Err(StreamError::InvalidConfig(format!(
                    "Channel {} out of range (1-{})",
                    ch.channel, MAX_CHANNEL
                )));
            }
            if !seen.insert(ch.channel) {
                return Err(StreamError::InvalidConfig(format!(
                    "Channel {} configured twice",
                    ch.channel
                )));
            }
        }

        if self.enabled_channels().next().is_none() {
            return Err(StreamError::InvalidConfig(
                "At least one channel must be enabled".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_paper_setup() {
        let config = AcquisitionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channels[0].voltage_range, VoltageRange::Mv39);
        assert!(!config.channels[0].single_ended);
        assert_eq!(config.sample_interval_ms(), 120);
    }

    #[test]
    fn test_counts_conversion() {
        let range = VoltageRange::Mv39;
        assert_eq!(range.counts_to_microvolts(ADC_MAX_COUNT), 39_000.0);
        assert_eq!(range.counts_to_microvolts(0), 0.0);
        assert_eq!(range.microvolts_to_counts(39_000.0), ADC_MAX_COUNT);
        assert_eq!(range.microvolts_to_counts(1.0e9), ADC_MAX_COUNT);
    }

    #[test]
    fn test_validate_rejects_bad_channels() {
        let mut config = AcquisitionConfig::single(17, VoltageRange::Mv39, true);
        assert!(matches!(config.validate(), Err(StreamError::InvalidConfig(_))));

        config.channels[0].channel = 0;
        assert!(config.validate().is_err());

        config = AcquisitionConfig::default();
        config.channels[0].enabled = false;
        assert!(config.validate().is_err());

        config = AcquisitionConfig::default();
        config.channels.push(ChannelConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_voltage_range_parsing() {
        assert_eq!("39".parse::<VoltageRange>().unwrap(), VoltageRange::Mv39);
        assert_eq!("mv1250".parse::<VoltageRange>().unwrap(), VoltageRange::Mv1250);
        assert_eq!("2500mV".parse::<VoltageRange>().unwrap(), VoltageRange::Mv2500);
        assert!("40".parse::<VoltageRange>().is_err());
    }

    #[test]
    fn test_conversion_time_from_millis() {
        assert_eq!(ConversionTime::from_millis(340).unwrap(), ConversionTime::Ms340);
        assert!(ConversionTime::from_millis(250).is_err());
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{"channels":[{"channel":3}]}"#;
        let config: AcquisitionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.channels[0].channel, 3);
        assert!(config.channels[0].enabled);
        assert!(config.mains_rejection_50hz);
        assert_eq!(config.conversion_time, ConversionTime::Ms100);
    }
}
