use thiserror::Error;

pub type Result<T> = std::result::Result<T, IibError>;

/// Errors raised by the worker.
///
/// `Validation`, `Iib` and `AddressAlreadyInUse` carry messages that are safe
/// to show in the request `state_reason`. HTTP and Kubernetes client failures
/// count as operational `Iib` failures. Everything else is reported as an
/// unknown error and kept in the logs.
#[derive(Debug, Error)]
pub enum IibError {
    /// Caller supplied parameters are invalid
    #[error("{0}")]
    Validation(String),

    /// An external tool or orchestration step failed
    #[error("{0}")]
    Iib(String),

    /// A port is held by another process or another worker on this host
    #[error("{0}")]
    AddressAlreadyInUse(String),

    /// The request is already `complete` or `failed`
    #[error("{0}")]
    FinalStateOverwrite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl IibError {
    pub fn iib(msg: impl Into<String>) -> Self {
        IibError::Iib(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        IibError::Validation(msg.into())
    }

    pub fn is_address_in_use(&self) -> bool {
        matches!(self, IibError::AddressAlreadyInUse(_))
    }

    pub fn is_iib(&self) -> bool {
        matches!(self, IibError::Iib(_))
    }

    /// `Iib` plus the client failures reported in the same category
    pub fn is_operational(&self) -> bool {
        matches!(self, IibError::Iib(_) | IibError::Http(_) | IibError::Kube(_))
    }

    /// Text written to the request's `state_reason` when it fails
    pub fn user_message(&self) -> String {
        match self {
            IibError::Validation(msg) | IibError::Iib(msg) | IibError::AddressAlreadyInUse(msg) => {
                msg.clone()
            }
            IibError::Http(_) | IibError::Kube(_) => self.to_string(),
            _ => "An unknown error occurred".to_string(),
        }
    }
}

impl From<config::ConfigError> for IibError {
    fn from(err: config::ConfigError) -> Self {
        IibError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for IibError {
    fn from(err: serde_yaml::Error) -> Self {
        IibError::Iib(format!("Failed to serialize YAML: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_for_operational_errors() {
        let err = IibError::iib("The bundle foo does not have the label a=b");
        assert_eq!(err.user_message(), "The bundle foo does not have the label a=b");

        let err = IibError::AddressAlreadyInUse("Port 50051 is already in use.".into());
        assert_eq!(err.user_message(), "Port 50051 is already in use.");
    }

    #[test]
    fn test_user_message_hides_internal_errors() {
        let err = IibError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"));
        assert_eq!(err.user_message(), "An unknown error occurred");

        let err = IibError::FinalStateOverwrite("already complete".into());
        assert_eq!(err.user_message(), "An unknown error occurred");
    }

    #[tokio::test]
    async fn test_user_message_for_client_errors() {
        let err = reqwest::Client::new()
            .get("http://iib-api.invalid:99999/builds/1")
            .send()
            .await
            .unwrap_err();
        let err = IibError::from(err);
        assert!(err.is_operational());
        assert!(!err.is_iib());
        assert_eq!(err.user_message(), err.to_string());
        assert_ne!(err.user_message(), "An unknown error occurred");
    }

    #[test]
    fn test_matchers() {
        assert!(IibError::AddressAlreadyInUse("x".into()).is_address_in_use());
        assert!(!IibError::iib("x").is_address_in_use());
        assert!(IibError::iib("x").is_iib());
        assert!(!IibError::validation("x").is_iib());
        assert!(IibError::iib("x").is_operational());
        assert!(!IibError::validation("x").is_operational());
    }
}
