use std::borrow::Cow;

pub use crate::model::ErrorData;
use crate::service::ServiceError;

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// This is an unified error type for the errors that can be returned anywhere
/// between establishing a session and tearing it down.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[cfg(feature = "client")]
    #[error("Client initialization error: {0}")]
    ClientInitialize(#[from] crate::service::ClientInitializeError),
    #[cfg(feature = "server")]
    #[error("Server initialization error: {0}")]
    ServerInitialize(#[from] crate::service::ServerInitializeError),
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::task::JoinError),
    #[error("Transport creation error: {error}")]
    TransportCreation {
        into_transport_type_name: Cow<'static, str>,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SdkError {
    pub fn transport_creation<T: 'static>(
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        SdkError::TransportCreation {
            into_transport_type_name: std::any::type_name::<T>().into(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorCode;

    #[test]
    fn error_data_display_without_data() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: None,
        };
        assert_eq!(format!("{}", error), "-32600: Invalid Request");
    }

    #[test]
    fn error_data_display_with_data() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: Some(serde_json::json!({"detail": "missing field"})),
        };
        assert_eq!(
            format!("{}", error),
            "-32600: Invalid Request({\"detail\":\"missing field\"})"
        );
    }

    #[test]
    fn error_data_is_std_error() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: None,
        };
        let _: &dyn std::error::Error = &error;
    }
}
