//! fsgate core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the fsgate core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod version {
    //! Engine version quad reported over the control channel.

    use serde::Serialize;

    /// Four-part engine version.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct CoreVersion {
        /// Major version.
        pub major: u16,
        /// Minor version.
        pub minor: u16,
        /// Patch version.
        pub patch: u16,
        /// Build number.
        pub build: u16,
    }

    /// Version quad of this engine build.
    pub const CORE_VERSION: CoreVersion = CoreVersion { major: 0, minor: 1, patch: 0, build: 0 };
}

pub mod status {
    //! Platform status codes carried on operations and admin replies.
    //!
    //! Codes follow the NT numbering the engine enforces against; zero and
    //! positive values are success, negative values are failures. Replies on
    //! the control channel carry the raw `u32` form.

    use std::fmt;

    /// Status of a file operation or admin request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
    pub struct OpStatus(pub i32);

    impl OpStatus {
        /// Operation completed.
        pub const SUCCESS: OpStatus = OpStatus(0);
        /// Malformed request, out-of-range enum value or impossible size.
        pub const INVALID_PARAMETER: OpStatus = OpStatus(0xC000_000D_u32 as i32);
        /// Policy denial, and the enforcement status for read-only streams.
        pub const ACCESS_DENIED: OpStatus = OpStatus(0xC000_0022_u32 as i32);
        /// Caller buffer cannot hold the result.
        pub const BUFFER_TOO_SMALL: OpStatus = OpStatus(0xC000_0023_u32 as i32);
        /// Monitor consumer is not attached.
        pub const PORT_DISCONNECTED: OpStatus = OpStatus(0xC000_0037_u32 as i32);
        /// Allocation failure.
        pub const INSUFFICIENT_RESOURCES: OpStatus = OpStatus(0xC000_009A_u32 as i32);
        /// No rule matched where one was required; also the optional
        /// open-denial variant selectable via configuration.
        pub const NOT_FOUND: OpStatus = OpStatus(0xC000_0225_u32 as i32);
        /// Store is draining or the admin port is already connected.
        pub const DEVICE_BUSY: OpStatus = OpStatus(0x8000_0011_u32 as i32);
        /// Request type is not part of the control protocol.
        pub const NOT_SUPPORTED: OpStatus = OpStatus(0xC000_00BB_u32 as i32);

        /// Whether the status denotes success (zero or informational).
        #[must_use]
        pub const fn is_success(self) -> bool {
            self.0 >= 0
        }

        /// Raw code as carried in reply headers.
        #[must_use]
        pub const fn code(self) -> u32 {
            self.0 as u32
        }

        /// Rebuild from the raw wire form.
        #[must_use]
        pub const fn from_code(code: u32) -> Self {
            OpStatus(code as i32)
        }
    }

    impl fmt::Display for OpStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "0x{:08X}", self.code())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn success_and_failure_split() {
            assert!(OpStatus::SUCCESS.is_success());
            assert!(OpStatus::DEVICE_BUSY.is_success()); // warning-class code
            assert!(!OpStatus::ACCESS_DENIED.is_success());
            assert!(!OpStatus::NOT_FOUND.is_success());
        }

        #[test]
        fn code_round_trip() {
            let s = OpStatus::ACCESS_DENIED;
            assert_eq!(OpStatus::from_code(s.code()), s);
            assert_eq!(format!("{s}"), "0xC0000022");
        }
    }
}

pub mod limits {
    //! Fixed size ceilings shared by the store, the queue and the codecs.

    /// Body capacity of one monitor frame.
    pub const FRAME_BODY_BYTES: usize = 32 * 1024;

    /// Fixed ceiling reserved for one record's non-path fields.
    pub const RECORD_HEADER_BYTES: usize = 512;

    /// Maximum encoded (UTF-16) byte length of a single path or pattern.
    /// One record must always fit in one frame.
    pub const MAX_PATH_BYTES: usize = FRAME_BODY_BYTES - RECORD_HEADER_BYTES;

    /// Default bound on queued monitor records.
    pub const DEFAULT_MAX_RECORDS: usize = 65_535;

    /// Upper bound accepted for one control message.
    pub const MAX_CONTROL_MESSAGE_BYTES: usize = 1024 * 1024;
}

pub mod action {
    //! Rule action codes.

    use serde::Serialize;
    use std::fmt;
    use std::str::FromStr;

    /// Enforcement effect of a rule on matched opens, writes and
    /// set-information operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum RuleMajor {
        /// Matched opens are denied outright.
        AccessDenied,
        /// Matched opens succeed; writes and destructive set-information
        /// calls on the opened stream are denied.
        ReadOnly,
    }

    /// Whether matches additionally emit audit records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum RuleMinor {
        /// No auditing.
        None,
        /// Matched operations produce monitor records.
        Monitored,
    }

    impl RuleMajor {
        /// Wire code (`u16`) of this action.
        #[must_use]
        pub const fn wire_code(self) -> u16 {
            match self {
                RuleMajor::AccessDenied => 1,
                RuleMajor::ReadOnly => 2,
            }
        }

        /// Decode the wire form; out-of-range codes are invalid input.
        #[must_use]
        pub const fn from_wire_code(code: u16) -> Option<Self> {
            match code {
                1 => Some(RuleMajor::AccessDenied),
                2 => Some(RuleMajor::ReadOnly),
                _ => None,
            }
        }

        /// Canonical admin-facing name.
        #[must_use]
        pub const fn as_str(self) -> &'static str {
            match self {
                RuleMajor::AccessDenied => "access-denied",
                RuleMajor::ReadOnly => "readonly",
            }
        }
    }

    impl RuleMinor {
        /// Wire code (`u16`) of this action.
        #[must_use]
        pub const fn wire_code(self) -> u16 {
            match self {
                RuleMinor::None => 0,
                RuleMinor::Monitored => 1,
            }
        }

        /// Decode the wire form; out-of-range codes are invalid input.
        #[must_use]
        pub const fn from_wire_code(code: u16) -> Option<Self> {
            match code {
                0 => Some(RuleMinor::None),
                1 => Some(RuleMinor::Monitored),
                _ => None,
            }
        }

        /// Canonical admin-facing name.
        #[must_use]
        pub const fn as_str(self) -> &'static str {
            match self {
                RuleMinor::None => "none",
                RuleMinor::Monitored => "monitored",
            }
        }
    }

    impl fmt::Display for RuleMajor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl fmt::Display for RuleMinor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for RuleMajor {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_lowercase().as_str() {
                "access-denied" => Ok(RuleMajor::AccessDenied),
                "readonly" => Ok(RuleMajor::ReadOnly),
                other => Err(format!("unknown major action '{other}'")),
            }
        }
    }

    impl FromStr for RuleMinor {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_lowercase().as_str() {
                "none" => Ok(RuleMinor::None),
                "monitored" => Ok(RuleMinor::Monitored),
                other => Err(format!("unknown minor action '{other}'")),
            }
        }
    }

}

pub mod rule {
    //! Rule value type and input validation.

    use super::action::{RuleMajor, RuleMinor};
    use super::limits::MAX_PATH_BYTES;
    use serde::Serialize;
    use thiserror::Error;

    /// One enforcement rule. Identity is the `(major, minor, pattern)`
    /// triple; `pattern` is stored upper-cased so matching never case-folds
    /// the stored side.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
    pub struct Rule {
        /// Enforcement effect.
        pub major: RuleMajor,
        /// Audit effect.
        pub minor: RuleMinor,
        /// Upper-cased wildcard expression over NT-style device paths.
        pub pattern: String,
    }

    /// Rejection reasons for rule input.
    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum RuleError {
        /// The pattern buffer is empty.
        #[error("rule pattern is empty")]
        EmptyPattern,
        /// The encoded pattern exceeds the per-record ceiling.
        #[error("rule pattern exceeds {MAX_PATH_BYTES} encoded bytes")]
        PatternTooLong,
    }

    impl Rule {
        /// Build a rule, upper-casing and validating the pattern.
        pub fn new(
            major: RuleMajor,
            minor: RuleMinor,
            pattern: impl AsRef<str>,
        ) -> Result<Self, RuleError> {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                return Err(RuleError::EmptyPattern);
            }
            if utf16_len(pattern) > MAX_PATH_BYTES {
                return Err(RuleError::PatternTooLong);
            }
            Ok(Rule { major, minor, pattern: pattern.to_uppercase() })
        }

        /// Identity triple used for duplicate detection and removal.
        #[must_use]
        pub fn identity(&self) -> (u16, u16, &str) {
            (self.major.wire_code(), self.minor.wire_code(), self.pattern.as_str())
        }
    }

    /// Encoded UTF-16LE byte length of a string.
    #[must_use]
    pub fn utf16_len(s: &str) -> usize {
        s.encode_utf16().count() * 2
    }

}

pub mod record {
    //! Monitor record schema shared by the pipeline, the queue and the
    //! codecs.

    use super::status::OpStatus;
    use serde::Serialize;

    /// File identity copied from the file system at open time.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct FileRef {
        /// Serial number of the owning volume.
        pub volume_serial: u64,
        /// 128-bit file identifier; 64-bit identifiers are zero-extended.
        pub file_id: [u8; 16],
    }

    /// Major operation kind of a record, numbered as the host dispatch codes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[repr(u8)]
    #[serde(rename_all = "kebab-case")]
    pub enum OpMajor {
        /// File open.
        Create = 0x00,
        /// Data write.
        Write = 0x04,
        /// Rename / delete-disposition and other metadata changes.
        SetInformation = 0x06,
        /// Handle cleanup.
        Cleanup = 0x12,
    }

    impl OpMajor {
        /// Wire code of this operation kind.
        #[must_use]
        pub const fn wire_code(self) -> u8 {
            self as u8
        }

        /// Decode the wire form.
        #[must_use]
        pub const fn from_wire_code(code: u8) -> Option<Self> {
            match code {
                0x00 => Some(OpMajor::Create),
                0x04 => Some(OpMajor::Write),
                0x06 => Some(OpMajor::SetInformation),
                0x12 => Some(OpMajor::Cleanup),
                _ => None,
            }
        }
    }

    /// Set-information sub-kind codes carried in `minor_fn`.
    pub mod set_info {
        /// Not a set-information record.
        pub const NONE: u8 = 0;
        /// Rename of the opened file.
        pub const RENAME: u8 = 10;
        /// Delete disposition on the opened file.
        pub const DISPOSITION: u8 = 13;
    }

    /// One immutable audit event.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct MonitorRecord {
        /// Operation kind.
        pub major_fn: OpMajor,
        /// Sub-kind for set-information records, zero otherwise.
        pub minor_fn: u8,
        /// Requestor process identifier.
        pub pid: u64,
        /// Requestor thread identifier.
        pub tid: u64,
        /// File identity, zeroed when the operation never opened the file.
        pub file: FileRef,
        /// Capture time, 100-ns ticks since the Unix epoch.
        pub record_time: i64,
        /// Status the operation completed with.
        pub op_status: OpStatus,
        /// Pattern of the matched rule.
        pub rule_pattern: String,
        /// Normalized path the operation targeted.
        pub file_path: String,
        /// Rename destination, present for rename records only.
        pub rename_path: Option<String>,
    }
}

pub mod config {
    //! Engine configuration, read once at startup from the environment.

    use super::limits::DEFAULT_MAX_RECORDS;

    /// Default control endpoint bind address.
    pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:29450";
    /// Default monitor channel bind address.
    pub const DEFAULT_MONITOR_ADDR: &str = "127.0.0.1:29451";

    /// Startup configuration.
    #[derive(Debug, Clone)]
    pub struct Config {
        /// Bound on queued monitor records.
        pub max_records: usize,
        /// Control endpoint bind address.
        pub control_addr: String,
        /// Monitor channel bind address.
        pub monitor_addr: String,
        /// Deny matched opens with `NOT_FOUND` instead of `ACCESS_DENIED`.
        pub deny_open_with_not_found: bool,
    }

    impl Default for Config {
        fn default() -> Self {
            Config {
                max_records: DEFAULT_MAX_RECORDS,
                control_addr: DEFAULT_CONTROL_ADDR.to_string(),
                monitor_addr: DEFAULT_MONITOR_ADDR.to_string(),
                deny_open_with_not_found: false,
            }
        }
    }

    impl Config {
        /// Read configuration from `FSGATE_*` environment variables,
        /// falling back to defaults for anything absent or unparsable.
        #[must_use]
        pub fn from_env() -> Self {
            let defaults = Config::default();
            Config {
                max_records: std::env::var("FSGATE_MAX_RECORDS")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(defaults.max_records),
                control_addr: std::env::var("FSGATE_CONTROL_ADDR")
                    .unwrap_or(defaults.control_addr),
                monitor_addr: std::env::var("FSGATE_MONITOR_ADDR")
                    .unwrap_or(defaults.monitor_addr),
                deny_open_with_not_found: std::env::var("FSGATE_DENY_OPEN_NOT_FOUND")
                    .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                    .unwrap_or(defaults.deny_open_with_not_found),
            }
        }
    }
}

pub mod time {
    //! Timestamp helper for monitor records.

    use std::time::{SystemTime, UNIX_EPOCH};

    /// Current time as 100-ns ticks since the Unix epoch.
    #[must_use]
    pub fn ticks_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as i64)
            .unwrap_or(0)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ticks_advance() {
            let a = ticks_now();
            let b = ticks_now();
            assert!(b >= a);
            assert!(a > 0);
        }
    }
}

pub mod logging {
    //! Structured logging setup with env filter.
    //! Set `FSGATE_LOG`, e.g. `info,rules=debug`.

    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

    /// Initialize the global subscriber. Safe to call more than once; later
    /// calls are no-ops.
    pub fn init() {
        let filter =
            EnvFilter::try_from_env("FSGATE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber =
            Registry::default().with(filter).with(fmt::layer().with_writer(std::io::stderr));
        tracing::subscriber::set_global_default(subscriber).ok();
    }
}
