/// Settings module - validated runtime configuration
///
/// Numeric bounds mirror the device documentation. Setters validate and
/// leave the previous value untouched on failure. The whole document can be
/// persisted as JSON and reloaded; loading re-validates every field.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SomError};

/// Maximum length of CoAP endpoint strings (hostname, resources, PSK)
pub const MAX_ENDPOINT_STRING_LEN: usize = 64;

/// Verbosity of persisted system logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Errors,
    Warnings,
    Informative,
}

/// Collector endpoint description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoapEndpoint {
    pub server_hostname: String,
    pub server_port: u16,
    pub tx_resource: String,
    pub tx_file_resource: String,
    pub tx_fw_resource: String,
    pub device_name: String,
    pub server_psk: String,
}

impl Default for CoapEndpoint {
    fn default() -> Self {
        Self {
            server_hostname: "127.0.0.1".to_string(),
            server_port: 5684,
            tx_resource: "data".to_string(),
            tx_file_resource: "file".to_string(),
            tx_fw_resource: "fw".to_string(),
            device_name: "som".to_string(),
            server_psk: String::new(),
        }
    }
}

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Periodic uplink interval in minutes (5..=1440)
    uplink_timeout: u16,
    /// Uplink interval in hours when PSM is not available (1..=24)
    no_psm_uplink_timeout: u16,
    /// Network attach timeout in seconds (1..=1800)
    lte_connection_timeout: u16,
    /// First retry delay in minutes (1..=60)
    resend_packet_initial_timeout: u8,
    /// Retry delay ceiling in hours (1..=24)
    max_resend_timeout: u8,
    /// Transmissions per message before giving up (1..=10)
    max_resend_attempts: u8,
    /// Acknowledgment wait in seconds (1..=60)
    response_wait_timeout: u8,
    /// Attempts per file block (1..=10)
    file_ul_retries: u8,
    /// Log file size limit in bytes (1024..=1048576)
    log_file_max_size: i32,
    /// Number of rotated log files kept (1..=20)
    num_of_log_files: u8,
    /// Log rotation check frequency in wakeup cycles (1..=50)
    log_rotation_frequency: u8,
    log_level: LogLevel,
    coap: CoapEndpoint,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            uplink_timeout: 60,
            no_psm_uplink_timeout: 24,
            lte_connection_timeout: 600,
            resend_packet_initial_timeout: 5,
            max_resend_timeout: 1,
            max_resend_attempts: 3,
            response_wait_timeout: 10,
            file_ul_retries: 3,
            log_file_max_size: 65536,
            num_of_log_files: 5,
            log_rotation_frequency: 10,
            log_level: LogLevel::Informative,
            coap: CoapEndpoint::default(),
        }
    }
}

fn check_range(name: &'static str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(SomError::out_of_range(name, value, min, max));
    }
    Ok(())
}

fn check_endpoint_string(name: &str, value: &str) -> Result<()> {
    if value.len() > MAX_ENDPOINT_STRING_LEN {
        return Err(SomError::InvalidArgument(format!(
            "{} longer than {} bytes",
            name, MAX_ENDPOINT_STRING_LEN
        )));
    }
    Ok(())
}

impl Settings {
    /// Load settings from JSON, validating every field
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize to the JSON document written to `settings.txt`
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SomError::SerializationError(e.to_string()))
    }

    /// Apply a partial JSON object (downlink settings update).
    ///
    /// The update is all-or-nothing: if any field fails validation the
    /// current settings are left as they were.
    pub fn apply_json_patch(&mut self, patch: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(patch)?;
        let serde_json::Value::Object(fields) = patch else {
            return Err(SomError::InvalidArgument(
                "settings update must be a JSON object".to_string(),
            ));
        };

        let mut current = serde_json::to_value(&*self)
            .map_err(|e| SomError::SerializationError(e.to_string()))?;
        if let serde_json::Value::Object(map) = &mut current {
            for (key, value) in fields {
                if !map.contains_key(&key) {
                    return Err(SomError::InvalidArgument(format!(
                        "unknown setting: {}",
                        key
                    )));
                }
                map.insert(key, value);
            }
        }

        let updated: Settings = serde_json::from_value(current)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Validate every field against its documented bounds
    pub fn validate(&self) -> Result<()> {
        check_range("uplink_timeout", self.uplink_timeout.into(), 5, 1440)?;
        check_range("no_psm_uplink_timeout", self.no_psm_uplink_timeout.into(), 1, 24)?;
        check_range("lte_connection_timeout", self.lte_connection_timeout.into(), 1, 1800)?;
        check_range(
            "resend_packet_initial_timeout",
            self.resend_packet_initial_timeout.into(),
            1,
            60,
        )?;
        check_range("max_resend_timeout", self.max_resend_timeout.into(), 1, 24)?;
        check_range("max_resend_attempts", self.max_resend_attempts.into(), 1, 10)?;
        check_range("response_wait_timeout", self.response_wait_timeout.into(), 1, 60)?;
        check_range("file_ul_retries", self.file_ul_retries.into(), 1, 10)?;
        check_range("log_file_max_size", self.log_file_max_size.into(), 1024, 1_048_576)?;
        check_range("num_of_log_files", self.num_of_log_files.into(), 1, 20)?;
        check_range("log_rotation_frequency", self.log_rotation_frequency.into(), 1, 50)?;

        check_endpoint_string("server_hostname", &self.coap.server_hostname)?;
        check_endpoint_string("tx_resource", &self.coap.tx_resource)?;
        check_endpoint_string("tx_file_resource", &self.coap.tx_file_resource)?;
        check_endpoint_string("tx_fw_resource", &self.coap.tx_fw_resource)?;
        check_endpoint_string("device_name", &self.coap.device_name)?;
        check_endpoint_string("server_psk", &self.coap.server_psk)?;
        Ok(())
    }

    pub fn set_uplink_timeout(&mut self, minutes: u16) -> Result<()> {
        check_range("uplink_timeout", minutes.into(), 5, 1440)?;
        self.uplink_timeout = minutes;
        Ok(())
    }

    pub fn set_no_psm_uplink_timeout(&mut self, hours: u16) -> Result<()> {
        check_range("no_psm_uplink_timeout", hours.into(), 1, 24)?;
        self.no_psm_uplink_timeout = hours;
        Ok(())
    }

    pub fn set_lte_connection_timeout(&mut self, seconds: u16) -> Result<()> {
        check_range("lte_connection_timeout", seconds.into(), 1, 1800)?;
        self.lte_connection_timeout = seconds;
        Ok(())
    }

    pub fn set_resend_packet_initial_timeout(&mut self, minutes: u8) -> Result<()> {
        check_range("resend_packet_initial_timeout", minutes.into(), 1, 60)?;
        self.resend_packet_initial_timeout = minutes;
        Ok(())
    }

    pub fn set_max_resend_timeout(&mut self, hours: u8) -> Result<()> {
        check_range("max_resend_timeout", hours.into(), 1, 24)?;
        self.max_resend_timeout = hours;
        Ok(())
    }

    pub fn set_max_resend_attempts(&mut self, attempts: u8) -> Result<()> {
        check_range("max_resend_attempts", attempts.into(), 1, 10)?;
        self.max_resend_attempts = attempts;
        Ok(())
    }

    pub fn set_response_wait_timeout(&mut self, seconds: u8) -> Result<()> {
        check_range("response_wait_timeout", seconds.into(), 1, 60)?;
        self.response_wait_timeout = seconds;
        Ok(())
    }

    pub fn set_file_ul_retries(&mut self, retries: u8) -> Result<()> {
        check_range("file_ul_retries", retries.into(), 1, 10)?;
        self.file_ul_retries = retries;
        Ok(())
    }

    pub fn set_log_file_max_size(&mut self, size: i32) -> Result<()> {
        check_range("log_file_max_size", size.into(), 1024, 1_048_576)?;
        self.log_file_max_size = size;
        Ok(())
    }

    pub fn set_num_of_log_files(&mut self, count: u8) -> Result<()> {
        check_range("num_of_log_files", count.into(), 1, 20)?;
        self.num_of_log_files = count;
        Ok(())
    }

    pub fn set_log_rotation_frequency(&mut self, frequency: u8) -> Result<()> {
        check_range("log_rotation_frequency", frequency.into(), 1, 50)?;
        self.log_rotation_frequency = frequency;
        Ok(())
    }

    pub fn set_log_level(&mut self, level: LogLevel) {
        self.log_level = level;
    }

    /// Replace the collector endpoint after validating string bounds
    pub fn set_coap_endpoint(&mut self, endpoint: CoapEndpoint) -> Result<()> {
        let previous = std::mem::replace(&mut self.coap, endpoint);
        if let Err(e) = self.validate() {
            self.coap = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn uplink_timeout(&self) -> u16 {
        self.uplink_timeout
    }

    pub fn no_psm_uplink_timeout(&self) -> u16 {
        self.no_psm_uplink_timeout
    }

    pub fn lte_connection_timeout(&self) -> u16 {
        self.lte_connection_timeout
    }

    pub fn resend_packet_initial_timeout(&self) -> u8 {
        self.resend_packet_initial_timeout
    }

    pub fn max_resend_timeout(&self) -> u8 {
        self.max_resend_timeout
    }

    pub fn max_resend_attempts(&self) -> u8 {
        self.max_resend_attempts
    }

    pub fn response_wait_timeout(&self) -> u8 {
        self.response_wait_timeout
    }

    pub fn file_ul_retries(&self) -> u8 {
        self.file_ul_retries
    }

    pub fn log_file_max_size(&self) -> i32 {
        self.log_file_max_size
    }

    pub fn num_of_log_files(&self) -> u8 {
        self.num_of_log_files
    }

    pub fn log_rotation_frequency(&self) -> u8 {
        self.log_rotation_frequency
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn coap(&self) -> &CoapEndpoint {
        &self.coap
    }

    /// Periodic mailer wake interval
    pub fn uplink_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.uplink_timeout) * 60)
    }

    /// First retry delay
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(u64::from(self.resend_packet_initial_timeout) * 60)
    }

    /// Retry delay ceiling
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_resend_timeout) * 3600)
    }

    /// Acknowledgment wait per attempt
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.response_wait_timeout))
    }
}
