//! 错误类型与错误码
//!
//! 库边界统一返回 [`PipelineError`]; 每个变体对应一个稳定的数字错误码 ([`ErrorCode`]),
//! 检测后端把最近一次失败记录为 [`ErrorDetails`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// 数字错误码 (与外部调用方约定, 取值固定)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum ErrorCode {
    #[default]
    NoError = 2000,
    DetectionError = 2001,
    BackendNotSelected = 2002,
    FileNotFound = 2003,
    ConfigurationError = 2004,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NoError",
            ErrorCode::DetectionError => "DetectionError",
            ErrorCode::BackendNotSelected => "BackendNotSelected",
            ErrorCode::FileNotFound => "FileNotFound",
            ErrorCode::ConfigurationError => "ConfigurationError",
        };
        write!(f, "{}({})", name, self.as_u16())
    }
}

/// 流水线错误
///
/// `Clone` 是必需的: 错误会被打包进 `StageResult` 跨线程传回调用方.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("{artifact} file not found: {}", path.display())]
    FileNotFound {
        artifact: &'static str,
        path: PathBuf,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("detection error: {0}")]
    Detection(String),

    #[error("backend not selected: {0}")]
    BackendNotSelected(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::FileNotFound { .. } => ErrorCode::FileNotFound,
            PipelineError::Configuration(_) => ErrorCode::ConfigurationError,
            PipelineError::Detection(_) => ErrorCode::DetectionError,
            PipelineError::BackendNotSelected(_) => ErrorCode::BackendNotSelected,
        }
    }

    pub fn file_not_found(artifact: &'static str, path: impl Into<PathBuf>) -> Self {
        PipelineError::FileNotFound {
            artifact,
            path: path.into(),
        }
    }

    pub fn details(&self) -> ErrorDetails {
        ErrorDetails {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// 错误码 + 可读信息
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorDetails {
    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::NoError
    }
}

impl From<&PipelineError> for ErrorDetails {
    fn from(err: &PipelineError) -> Self {
        err.details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_external_values() {
        assert_eq!(ErrorCode::NoError.as_u16(), 2000);
        assert_eq!(ErrorCode::DetectionError.as_u16(), 2001);
        assert_eq!(ErrorCode::BackendNotSelected.as_u16(), 2002);
        assert_eq!(ErrorCode::FileNotFound.as_u16(), 2003);
        assert_eq!(ErrorCode::ConfigurationError.as_u16(), 2004);
    }

    #[test]
    fn file_not_found_names_artifact() {
        let err = PipelineError::file_not_found("weights", "/tmp/missing.weights");
        assert_eq!(err.code(), ErrorCode::FileNotFound);
        assert_eq!(
            err.to_string(),
            "weights file not found: /tmp/missing.weights"
        );
    }

    #[test]
    fn default_details_is_no_error() {
        let details = ErrorDetails::default();
        assert!(details.is_ok());
        assert!(details.message.is_empty());

        let details = PipelineError::Detection("boom".into()).details();
        assert_eq!(details.code, ErrorCode::DetectionError);
        assert!(!details.is_ok());
    }
}
