// ringcap-config/src/validation.rs
//! Custom validation functions for configuration.

use lazy_static::lazy_static;
use regex::Regex;
use validator::ValidationError;

/// `IFNAMSIZ` minus the trailing NUL.
const MAX_INTERFACE_LEN: usize = 15;

lazy_static! {
    static ref INTERFACE_NAME: Regex = Regex::new("^[a-zA-Z0-9_.:-]+$").unwrap();
    static ref LOG_LEVEL: Regex = Regex::new("^(?i)(trace|debug|info|warn|error)$").unwrap();
}

/// Validate that an interface name follows Linux naming conventions.
pub fn validate_interface(name: &str) -> Result<(), ValidationError> {
    if name.len() <= MAX_INTERFACE_LEN && INTERFACE_NAME.is_match(name) && name != "." && name != ".."
    {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_interface"))
    }
}

/// Validate that a given value is a power of two.
pub fn validate_power_of_two(value: u32) -> Result<(), ValidationError> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_power_of_two"))
    }
}

/// Frames start on `TPACKET_ALIGNMENT` boundaries.
pub fn validate_frame_alignment(value: u32) -> Result<(), ValidationError> {
    if value % 16 == 0 {
        Ok(())
    } else {
        Err(ValidationError::new("must_be_16_byte_aligned"))
    }
}

/// Validate a `tracing` level name.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVEL.is_match(level) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}
