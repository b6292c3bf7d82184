//! Capture session configuration
//!
//! Derived from the `[capture]` section of `flagwatch.toml`:
//!
//! ```ignore
//! let config = CaptureConfig::from_core(&core_config.capture)?;
//! ```

use std::fmt;
use std::str::FromStr;

use flagwatch_core::config::CaptureSection;

use crate::error::CaptureError;

/// How much of each packet the kernel copies to userspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CopyMode {
    /// Metadata only, no payload
    Meta,
    /// Metadata plus up to `copy_range` payload bytes
    #[default]
    Packet,
}

impl CopyMode {
    /// `NFULNL_COPY_*` value.
    pub fn wire_value(self) -> u8 {
        match self {
            Self::Meta => 0x01,
            Self::Packet => 0x02,
        }
    }
}

impl FromStr for CopyMode {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "meta" => Ok(Self::Meta),
            "packet" => Ok(Self::Packet),
            other => Err(CaptureError::Config {
                field: "copy_mode".to_owned(),
                reason: format!("'{other}' is not one of: packet, meta"),
            }),
        }
    }
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meta => f.write_str("meta"),
            Self::Packet => f.write_str("packet"),
        }
    }
}

/// Immutable settings for one [`CaptureSession`](crate::CaptureSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// NFLOG group to bind
    pub group: u16,
    pub copy_mode: CopyMode,
    /// Max payload bytes per packet (packet mode)
    pub copy_range: u32,
    /// Kernel-side buffer size, `None` keeps the kernel default
    pub buffer_size: Option<u32>,
    /// Userspace receive buffer length
    pub recv_buffer_len: usize,
    /// Also bind the AF_INET6 log handler
    pub ipv6: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            group: 100,
            copy_mode: CopyMode::Packet,
            copy_range: 0xffff,
            buffer_size: None,
            recv_buffer_len: 128 * 1024,
            ipv6: false,
        }
    }
}

impl CaptureConfig {
    /// Builds the config from the `[capture]` section.
    pub fn from_core(section: &CaptureSection) -> Result<Self, CaptureError> {
        Ok(Self {
            group: section.group,
            copy_mode: section.copy_mode.parse()?,
            copy_range: section.copy_range,
            buffer_size: (section.buffer_size > 0).then_some(section.buffer_size),
            recv_buffer_len: section.recv_buffer_len,
            ..Self::default()
        })
    }

    pub fn with_group(mut self, group: u16) -> Self {
        self.group = group;
        self
    }

    pub fn with_ipv6(mut self, ipv6: bool) -> Self {
        self.ipv6 = ipv6;
        self
    }
}
