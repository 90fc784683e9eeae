//! # gRPC Client Library
//!
//! Channel construction, auth interceptors and wire conversions shared by
//! the broker clients.
//!
//! ```ignore
//! use grpc_client::{create_channel_lazy_with_config, AuthInterceptor, ChannelConfig};
//! use protos::taskbroker::v1::consumer_service_client::ConsumerServiceClient;
//!
//! let channel = create_channel_lazy_with_config("http://127.0.0.1:50051", ChannelConfig::broker())?;
//! let client = ConsumerServiceClient::with_interceptor(channel, AuthInterceptor::from_secret(None));
//! ```

pub mod channel;
pub mod conversions;
pub mod error;
pub mod interceptors;

pub use channel::{ChannelConfig, create_channel_lazy, create_channel_lazy_with_config};
pub use error::{GrpcError, GrpcResult, ToTonicOption, is_connection_error};
pub use interceptors::AuthInterceptor;
