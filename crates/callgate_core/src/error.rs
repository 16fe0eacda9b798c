use thiserror::Error;

/// Synchronous rejections of a batch or a request-call.
///
/// These are returned before anything is mutated: the call, the batch and
/// the completion queue are left exactly as they were.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CallError {
    /// Generic failure (e.g. the call is already finished).
    #[error("call error")]
    Error,

    /// The operation is only valid on a client call.
    #[error("operation not valid on a server call")]
    NotOnServer,

    /// The operation is only valid on a server call.
    #[error("operation not valid on a client call")]
    NotOnClient,

    /// The same operation type appears more than once in one batch.
    #[error("too many operations of the same type in one batch")]
    TooManyOperations,

    /// Flags outside the allowed mask for the operation.
    #[error("invalid flags")]
    InvalidFlags,

    /// A metadata key or value failed validation, or there were too many entries.
    #[error("invalid metadata")]
    InvalidMetadata,

    /// The completion queue was not registered with this server.
    #[error("completion queue is not a server completion queue")]
    NotServerCompletionQueue,

    /// Payload out-parameter does not match the registered method's declaration.
    #[error("payload type mismatch with registered method")]
    PayloadTypeMismatch,

    /// The completion queue is shutting down and accepts no new tags.
    #[error("completion queue is shut down")]
    CompletionQueueShutdown,

    /// A numeric code with no known meaning.
    #[error("unknown call error code: {0}")]
    Unknown(u32),
}

impl CallError {
    pub const CODE_ERROR: u32 = 1;
    pub const CODE_NOT_ON_SERVER: u32 = 2;
    pub const CODE_NOT_ON_CLIENT: u32 = 3;
    pub const CODE_TOO_MANY_OPERATIONS: u32 = 8;
    pub const CODE_INVALID_FLAGS: u32 = 9;
    pub const CODE_INVALID_METADATA: u32 = 10;
    pub const CODE_NOT_SERVER_COMPLETION_QUEUE: u32 = 12;
    pub const CODE_PAYLOAD_TYPE_MISMATCH: u32 = 14;
    pub const CODE_COMPLETION_QUEUE_SHUTDOWN: u32 = 15;

    pub fn to_code(&self) -> u32 {
        match self {
            CallError::Error => Self::CODE_ERROR,
            CallError::NotOnServer => Self::CODE_NOT_ON_SERVER,
            CallError::NotOnClient => Self::CODE_NOT_ON_CLIENT,
            CallError::TooManyOperations => Self::CODE_TOO_MANY_OPERATIONS,
            CallError::InvalidFlags => Self::CODE_INVALID_FLAGS,
            CallError::InvalidMetadata => Self::CODE_INVALID_METADATA,
            CallError::NotServerCompletionQueue => Self::CODE_NOT_SERVER_COMPLETION_QUEUE,
            CallError::PayloadTypeMismatch => Self::CODE_PAYLOAD_TYPE_MISMATCH,
            CallError::CompletionQueueShutdown => Self::CODE_COMPLETION_QUEUE_SHUTDOWN,
            CallError::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            Self::CODE_ERROR => CallError::Error,
            Self::CODE_NOT_ON_SERVER => CallError::NotOnServer,
            Self::CODE_NOT_ON_CLIENT => CallError::NotOnClient,
            Self::CODE_TOO_MANY_OPERATIONS => CallError::TooManyOperations,
            Self::CODE_INVALID_FLAGS => CallError::InvalidFlags,
            Self::CODE_INVALID_METADATA => CallError::InvalidMetadata,
            Self::CODE_NOT_SERVER_COMPLETION_QUEUE => CallError::NotServerCompletionQueue,
            Self::CODE_PAYLOAD_TYPE_MISMATCH => CallError::PayloadTypeMismatch,
            Self::CODE_COMPLETION_QUEUE_SHUTDOWN => CallError::CompletionQueueShutdown,
            other => CallError::Unknown(other),
        }
    }
}

/// Errors from server lifecycle misuse.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// `start` was called twice.
    #[error("server already started")]
    AlreadyStarted,

    /// Registration after `start`, which would change the matcher set.
    #[error("cannot register after the server has started")]
    RegistrationClosed,

    /// The same (method, host) pair was registered twice.
    #[error("method '{method}' already registered for host {host:?}")]
    MethodAlreadyRegistered {
        method: String,
        host: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_codes_are_stable() {
        let all = [
            CallError::Error,
            CallError::NotOnServer,
            CallError::NotOnClient,
            CallError::TooManyOperations,
            CallError::InvalidFlags,
            CallError::InvalidMetadata,
            CallError::NotServerCompletionQueue,
            CallError::PayloadTypeMismatch,
            CallError::CompletionQueueShutdown,
        ];
        for err in all {
            assert_eq!(CallError::from_code(err.to_code()), err);
        }
        assert_eq!(CallError::NotOnServer.to_code(), 2);
        assert_eq!(CallError::TooManyOperations.to_code(), 8);
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(CallError::from_code(99), CallError::Unknown(99));
        assert_eq!(CallError::Unknown(99).to_code(), 99);
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::MethodAlreadyRegistered {
            method: "/echo.Echo/Say".into(),
            host: None,
        };
        assert_eq!(
            err.to_string(),
            "method '/echo.Echo/Say' already registered for host None"
        );
    }
}
