//! Unified error handling for the transit-otp pipeline.
//!
//! One error type covers the whole job, from catalog loading to the
//! per-route workers. The variants mirror the propagation policy: input
//! and catalog problems abort the job before fan-out, while geometric,
//! integrity, and numeric problems are dropped row-by-row inside a
//! worker and only surface in the route report.

use std::fmt;

/// Unified error type for pipeline operations.
#[derive(Debug, Clone)]
pub enum OtpError {
    /// A required input file or directory is absent
    InputMissing { path: String },
    /// Geometry/schedule artifacts disagree with each other
    CatalogInvalid { route: String, message: String },
    /// A point could not be projected, or a polyline is unusable
    Geometric { message: String },
    /// A merge or lookup came back empty where data was required
    DataIntegrity { message: String },
    /// Negative time delta, absurd speed, or similar nonsense
    NumericAnomaly { message: String },
    /// A per-route worker died; the route is excluded from aggregates
    TaskFailure { route: String, message: String },
    /// Filesystem error while reading or writing a declared interface
    Io { path: String, message: String },
    /// A record in an input table could not be parsed
    Parse { message: String },
}

impl fmt::Display for OtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtpError::InputMissing { path } => {
                write!(f, "Required input '{}' is missing", path)
            }
            OtpError::CatalogInvalid { route, message } => {
                write!(f, "Catalog for route '{}' is invalid: {}", route, message)
            }
            OtpError::Geometric { message } => {
                write!(f, "Geometric error: {}", message)
            }
            OtpError::DataIntegrity { message } => {
                write!(f, "Data integrity error: {}", message)
            }
            OtpError::NumericAnomaly { message } => {
                write!(f, "Numeric anomaly: {}", message)
            }
            OtpError::TaskFailure { route, message } => {
                write!(f, "Route task '{}' failed: {}", route, message)
            }
            OtpError::Io { path, message } => {
                write!(f, "I/O error on '{}': {}", path, message)
            }
            OtpError::Parse { message } => {
                write!(f, "Parse error: {}", message)
            }
        }
    }
}

impl std::error::Error for OtpError {}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, OtpError>;

impl OtpError {
    /// Map an I/O error onto the path that produced it.
    pub fn io(path: impl Into<String>, err: std::io::Error) -> Self {
        OtpError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Exit code the driver should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            OtpError::InputMissing { .. }
            | OtpError::CatalogInvalid { .. }
            | OtpError::Io { .. }
            | OtpError::Parse { .. } => 1,
            _ => 3,
        }
    }
}

/// Extension trait for converting Option into pipeline errors.
pub trait OptionExt<T> {
    /// Convert Option to Result with a data integrity error.
    fn ok_or_integrity(self, message: &str) -> Result<T>;

    /// Convert Option to Result with a geometric error.
    fn ok_or_geometric(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_integrity(self, message: &str) -> Result<T> {
        self.ok_or_else(|| OtpError::DataIntegrity {
            message: message.to_string(),
        })
    }

    fn ok_or_geometric(self, message: &str) -> Result<T> {
        self.ok_or_else(|| OtpError::Geometric {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OtpError::CatalogInvalid {
            route: "201-Outbound".to_string(),
            message: "segment order".to_string(),
        };
        assert!(err.to_string().contains("201-Outbound"));
        assert!(err.to_string().contains("segment order"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_integrity("missing stop_sequence");
        assert!(matches!(result, Err(OtpError::DataIntegrity { .. })));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            OtpError::InputMissing {
                path: "x".to_string()
            }
            .exit_code(),
            1
        );
        assert_eq!(
            OtpError::TaskFailure {
                route: "r".to_string(),
                message: "m".to_string()
            }
            .exit_code(),
            3
        );
    }
}
