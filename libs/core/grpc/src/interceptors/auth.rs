use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Status};

/// Interceptor stamping the shared RPC secret onto every broker call
///
/// Brokers without authentication are supported by building the interceptor
/// from `None`, in which case requests pass through untouched.
///
/// # Example
/// ```ignore
/// use grpc_client::interceptors::AuthInterceptor;
///
/// let auth = AuthInterceptor::from_secret(settings.rpc_secret.clone());
/// let client = ConsumerServiceClient::with_interceptor(channel, auth);
/// ```
#[derive(Clone, Debug, Default)]
pub struct AuthInterceptor {
  header_value: Option<String>,
}

impl AuthInterceptor {
  /// `authorization: Bearer <token>`
  pub fn bearer(token: impl Into<String>) -> Self {
    Self {
      header_value: Some(format!("Bearer {}", token.into())),
    }
  }

  /// Bearer auth when a secret is configured, pass-through otherwise
  pub fn from_secret(secret: Option<String>) -> Self {
    match secret {
      Some(secret) if !secret.is_empty() => Self::bearer(secret),
      _ => Self::default(),
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.header_value.is_some()
  }
}

impl tonic::service::Interceptor for AuthInterceptor {
  fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
    if let Some(value) = &self.header_value {
      let value: MetadataValue<Ascii> = value
        .parse()
        .map_err(|_| Status::internal("RPC secret is not a valid header value"))?;
      request.metadata_mut().insert("authorization", value);
    }
    Ok(request)
  }
}
