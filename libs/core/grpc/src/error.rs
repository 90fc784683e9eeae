use thiserror::Error;

pub type GrpcResult<T> = Result<T, GrpcError>;

/// Errors that can occur while building broker channels
#[derive(Error, Debug)]
pub enum GrpcError {
  /// Invalid URI provided for connection
  #[error("Invalid URI '{uri}': {source}")]
  InvalidUri {
    uri: String,
    #[source]
    source: tonic::transport::Error,
  },

  /// Invalid configuration
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),
}

impl From<GrpcError> for tonic::Status {
  fn from(err: GrpcError) -> Self {
    tonic::Status::invalid_argument(err.to_string())
  }
}

/// Whether a status means the broker could not be reached, as opposed to the
/// broker answering with an application error.
///
/// `Unavailable` covers refused and reset connections, `DeadlineExceeded`
/// covers hung ones, and `Unknown` is what tonic reports when the transport
/// fails before a status is received.
pub fn is_connection_error(status: &tonic::Status) -> bool {
  matches!(
    status.code(),
    tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Unknown
  )
}

/// Extension trait for Option types to convert None to tonic::Status errors
///
/// # Example
/// ```ignore
/// use grpc_client::error::ToTonicOption;
///
/// let task = store.pop().ok_or_not_found("no pending activation")?;
/// ```
pub trait ToTonicOption<T> {
  /// Convert None to a tonic::Status with NOT_FOUND code
  fn ok_or_not_found(self, message: impl Into<String>) -> Result<T, tonic::Status>;

  /// Convert None to a tonic::Status with INVALID_ARGUMENT code
  fn ok_or_invalid(self, message: impl Into<String>) -> Result<T, tonic::Status>;
}

impl<T> ToTonicOption<T> for Option<T> {
  fn ok_or_not_found(self, message: impl Into<String>) -> Result<T, tonic::Status> {
    self.ok_or_else(|| tonic::Status::not_found(message.into()))
  }

  fn ok_or_invalid(self, message: impl Into<String>) -> Result<T, tonic::Status> {
    self.ok_or_else(|| tonic::Status::invalid_argument(message.into()))
  }
}
