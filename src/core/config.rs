//! Pool creation parameters

use crate::error::Result;
use crate::header::{MAX_SEGMENT_SHIFT, MIN_SEGMENT_SHIFT};
use serde::{Deserialize, Serialize};

/// Default segment shift (256 KiB segments)
pub const DEFAULT_SEGMENT_SHIFT: u32 = 18;

/// Default number of unreferenced views kept mapped
pub const DEFAULT_MAX_INACTIVE_VIEWS: usize = 128;

/// Parameters for creating or opening a pool
///
/// `segment_shift` only matters when a new file is created; an existing pool
/// keeps the shift stored in its header.
///
/// ```toml
/// segment_shift = 20
/// max_inactive_views = 64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolParameters {
    /// log2 of the segment size, clamped to [16, 28]
    pub segment_shift: u32,
    /// Unreferenced views kept mapped before the least recently used is unmapped
    pub max_inactive_views: usize,
}

impl Default for PoolParameters {
    fn default() -> Self {
        PoolParameters {
            segment_shift: DEFAULT_SEGMENT_SHIFT,
            max_inactive_views: DEFAULT_MAX_INACTIVE_VIEWS,
        }
    }
}

impl PoolParameters {
    /// Parse parameters from TOML; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Clamp out-of-range values
    ///
    /// Returns the usable parameters and whether anything was changed.
    pub fn normalized(&self) -> (Self, bool) {
        let segment_shift = self.segment_shift.clamp(MIN_SEGMENT_SHIFT, MAX_SEGMENT_SHIFT);
        let adjusted = segment_shift != self.segment_shift;
        (
            PoolParameters {
                segment_shift,
                ..*self
            },
            adjusted,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;

    #[test]
    fn test_defaults() {
        let params = PoolParameters::default();
        assert_eq!(params.segment_shift, 18);
        assert_eq!(params.max_inactive_views, 128);
        assert_eq!(params.normalized(), (params, false));
    }

    #[test]
    fn test_normalize_clamps_shift() {
        let low = PoolParameters {
            segment_shift: 4,
            ..Default::default()
        };
        let (fixed, adjusted) = low.normalized();
        assert!(adjusted);
        assert_eq!(fixed.segment_shift, 16);

        let high = PoolParameters {
            segment_shift: 31,
            max_inactive_views: 3,
        };
        let (fixed, adjusted) = high.normalized();
        assert!(adjusted);
        assert_eq!(fixed.segment_shift, 28);
        assert_eq!(fixed.max_inactive_views, 3);
    }

    #[test]
    fn test_from_toml() {
        let params = PoolParameters::from_toml_str("segment_shift = 20\n").unwrap();
        assert_eq!(params.segment_shift, 20);
        assert_eq!(params.max_inactive_views, DEFAULT_MAX_INACTIVE_VIEWS);

        let params = PoolParameters::from_toml_str("").unwrap();
        assert_eq!(params, PoolParameters::default());
    }

    #[test]
    fn test_toml_round_trip() {
        let params = PoolParameters {
            segment_shift: 22,
            max_inactive_views: 7,
        };
        let text = params.to_toml_string().unwrap();
        assert!(text.contains("segment_shift = 22"));
        assert_eq!(PoolParameters::from_toml_str(&text).unwrap(), params);
    }

    #[test]
    fn test_bad_toml() {
        let result = PoolParameters::from_toml_str("segment_shift = \"big\"");
        assert!(matches!(result, Err(PoolError::Config(_))));
    }
}
