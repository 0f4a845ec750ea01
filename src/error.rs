//! Error types for the camera pipeline and control channel.
//!
//! All errors implement `std::error::Error` and carry enough context to decide
//! whether an operation is worth retrying.
//!
//! ## Error Categories
//!
//! - **Configuration Errors**: Missing explain URL, server address or token
//! - **Connection Errors**: Failed opens, handshakes and refused connections
//! - **I/O Errors**: Writes or reads that fail after a request was opened
//! - **Capture Errors**: No frame available from the sensor
//! - **Encode Errors**: JPEG conversion failures
//! - **Protocol Errors**: Non-success status codes from the explain server
//! - **Exhaustion Errors**: Retry budget used up, manager must be restarted
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use camlink::CameraError;
//!
//! let error = CameraError::connection_failed("server refused connection");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for camera operations.
pub type Result<T, E = CameraError> = std::result::Result<T, E>;

/// Main error type for camera and connection operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CameraError {
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Connection failed: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O failure during {operation}")]
    Io {
        operation: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Frame capture failed: {reason}")]
    Capture { reason: String },

    #[error("JPEG encoding failed: {details}")]
    Encode { details: String },

    #[error("Upload rejected with status code {status}")]
    UploadStatus { status: u16 },

    #[error("Gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Control channel is not connected")]
    NotConnected,

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Channel closed: {context}")]
    ChannelClosed { context: String },
}

impl CameraError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            CameraError::Connection { .. } => true,
            CameraError::Io { .. } => true,
            CameraError::Capture { .. } => true,
            CameraError::Timeout { .. } => true,
            CameraError::NotConnected => true,
            CameraError::Config { .. } => false,
            CameraError::Encode { .. } => false,
            CameraError::UploadStatus { .. } => false,
            CameraError::RetriesExhausted { .. } => false,
            CameraError::Parse { .. } => false,
            CameraError::ChannelClosed { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            CameraError::Config { .. } => vec![
                "Set the explain URL and token before requesting an explanation",
                "Check the server URL in the connection settings",
            ],
            CameraError::Connection { .. } => vec![
                "Check network connectivity",
                "Verify the server address is reachable",
                "Wait for the reconnect loop to retry",
            ],
            CameraError::Io { .. } => vec![
                "Check network stability",
                "Retry the request",
            ],
            CameraError::Capture { .. } => vec![
                "Make sure the camera is started",
                "Retry after a short delay; the sensor may be warming up",
            ],
            CameraError::Encode { .. } => vec![
                "Verify the frame size matches the configured pixel format",
                "Lower the JPEG quality setting",
            ],
            CameraError::UploadStatus { .. } => vec![
                "Check the explain token",
                "Inspect the server logs for the rejected request",
            ],
            CameraError::RetriesExhausted { .. } => vec![
                "Restart the connection manager",
                "Increase the maximum reconnect attempts",
            ],
            CameraError::NotConnected => vec![
                "Wait for the control channel to connect",
                "Start the connection manager",
            ],
            CameraError::Timeout { .. } => vec![
                "Increase the timeout duration",
                "Check server responsiveness",
            ],
            CameraError::Parse { .. } => vec![
                "Check the configuration file syntax",
                "Verify the message format",
            ],
            CameraError::ChannelClosed { .. } => vec![
                "The other side of the pipeline exited; retry the operation",
            ],
        }
    }

    /// User-facing message for the explain result.
    ///
    /// Connection errors mean the explain server was never reached; every
    /// other failure after the request was opened counts as a failed upload.
    pub fn failure_message(&self) -> &'static str {
        match self {
            CameraError::Config { .. } => "Image explain URL or token is not set",
            CameraError::Connection { .. } => "Failed to connect to explain URL",
            CameraError::Capture { .. } => "Camera capture failed",
            _ => "Failed to upload photo",
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        CameraError::Config { reason: reason.into() }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        CameraError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        CameraError::Connection { reason: reason.into(), source: Some(source.into()) }
    }

    /// Helper constructor for I/O errors.
    pub fn io(operation: impl Into<String>) -> Self {
        CameraError::Io { operation: operation.into(), source: None }
    }

    /// Helper constructor for I/O errors with source.
    pub fn io_with_source(
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        CameraError::Io { operation: operation.into(), source: Some(source.into()) }
    }

    /// Helper constructor for capture errors.
    pub fn capture_failed(reason: impl Into<String>) -> Self {
        CameraError::Capture { reason: reason.into() }
    }

    /// Helper constructor for encode errors.
    pub fn encode_failed(details: impl Into<String>) -> Self {
        CameraError::Encode { details: details.into() }
    }

    /// Helper constructor for closed channel errors.
    pub fn channel_closed(context: impl Into<String>) -> Self {
        CameraError::ChannelClosed { context: context.into() }
    }
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::Io { operation: "unknown operation".to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_json::Error> for CameraError {
    fn from(err: serde_json::Error) -> Self {
        CameraError::Parse { context: "JSON".to_string(), details: err.to_string() }
    }
}

impl From<serde_yaml_ng::Error> for CameraError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        CameraError::Parse { context: "YAML".to_string(), details: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            reason in ".*",
            status in 100u16..600u16,
            attempts in 1u32..100u32,
            duration_ms in 1u64..60000u64
          ) {
            let connection_msg = CameraError::connection_failed(reason.clone()).to_string();
            prop_assert!(connection_msg.contains(&reason));

            let config_msg = CameraError::config(reason.clone()).to_string();
            prop_assert!(config_msg.contains(&reason));

            let status_msg = CameraError::UploadStatus { status }.to_string();
            prop_assert!(status_msg.contains(&status.to_string()));

            let exhausted_msg = CameraError::RetriesExhausted { attempts }.to_string();
            prop_assert!(exhausted_msg.contains(&attempts.to_string()));

            let timeout = CameraError::Timeout { duration: Duration::from_millis(duration_ms) };
            prop_assert!(!timeout.to_string().is_empty());
          }

          #[test]
          fn source_chain_is_preserved(base_message in ".*") {
            let io_err = std::io::Error::other(base_message.clone());
            let error = CameraError::connection_failed_with_source("open failed", io_err);

            let source = std::error::Error::source(&error);
            prop_assert!(source.is_some());
            prop_assert_eq!(source.map(|s| s.to_string()), Some(base_message));
          }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<CameraError>();

        let error = CameraError::NotConnected;
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retry_classification_follows_taxonomy() {
        assert!(CameraError::connection_failed("refused").is_retryable());
        assert!(CameraError::io("write").is_retryable());
        assert!(CameraError::capture_failed("no frame").is_retryable());

        assert!(!CameraError::config("missing url").is_retryable());
        assert!(!CameraError::UploadStatus { status: 500 }.is_retryable());
        assert!(!CameraError::RetriesExhausted { attempts: 3 }.is_retryable());

        for suggestion in (CameraError::RetriesExhausted { attempts: 3 }).recovery_suggestions() {
            assert!(suggestion.len() > 5);
        }
    }

    #[test]
    fn failure_messages_separate_connect_from_upload() {
        assert_eq!(
            CameraError::config("no url").failure_message(),
            "Image explain URL or token is not set"
        );
        assert_eq!(
            CameraError::connection_failed("refused").failure_message(),
            "Failed to connect to explain URL"
        );
        assert_eq!(CameraError::UploadStatus { status: 500 }.failure_message(), "Failed to upload photo");
        assert_eq!(CameraError::io("write").failure_message(), "Failed to upload photo");
    }

    #[test]
    fn from_conversions_work() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let converted: CameraError = io_err.into();
        assert!(matches!(converted, CameraError::Io { .. }));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let converted: CameraError = json_err.into();
        assert!(matches!(converted, CameraError::Parse { ref context, .. } if context == "JSON"));
    }
}
