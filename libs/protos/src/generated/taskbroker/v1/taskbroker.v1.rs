// @generated
// This file is @generated by prost-build.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct RetryState {
    /// Zero-based number of attempts already made.
    #[prost(uint32, tag = "1")]
    pub attempts: u32,
    /// Total number of attempts allowed, including the first.
    #[prost(uint32, tag = "2")]
    pub max_attempts: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TaskActivation {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub namespace: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub taskname: ::prost::alloc::string::String,
    /// JSON {"args": \[...\], "kwargs": {...}}, zstd-compressed when the
    /// "compression-type" header says so.
    #[prost(bytes = "vec", tag = "4")]
    pub parameters: ::prost::alloc::vec::Vec<u8>,
    #[prost(map = "string, string", tag = "5")]
    pub headers: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    #[prost(message, optional, tag = "6")]
    pub retry_state: ::core::option::Option<RetryState>,
    #[prost(uint64, tag = "7")]
    pub processing_deadline_duration: u64,
    #[prost(int64, tag = "8")]
    pub received_at_ms: i64,
}
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct GetTaskRequest {
    #[prost(string, optional, tag = "1")]
    pub namespace: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub topic: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(uint32, optional, tag = "3")]
    pub partition: ::core::option::Option<u32>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTaskResponse {
    #[prost(message, optional, tag = "1")]
    pub task: ::core::option::Option<TaskActivation>,
}
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct SetTaskStatusRequest {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(enumeration = "TaskActivationStatus", tag = "2")]
    pub status: i32,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct SetTaskStatusResponse {}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskActivationStatus {
    Unspecified = 0,
    Pending = 1,
    Processing = 2,
    Failure = 3,
    Retry = 4,
    Complete = 5,
}
impl TaskActivationStatus {
    /// String value of the enum field names used in the ProtoBuf definition.
    ///
    /// The values are not transformed in any way and thus are considered stable
    /// (if the ProtoBuf definition does not change) and safe for programmatic use.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Self::Unspecified => "TASK_ACTIVATION_STATUS_UNSPECIFIED",
            Self::Pending => "TASK_ACTIVATION_STATUS_PENDING",
            Self::Processing => "TASK_ACTIVATION_STATUS_PROCESSING",
            Self::Failure => "TASK_ACTIVATION_STATUS_FAILURE",
            Self::Retry => "TASK_ACTIVATION_STATUS_RETRY",
            Self::Complete => "TASK_ACTIVATION_STATUS_COMPLETE",
        }
    }
    /// Creates an enum from field names used in the ProtoBuf definition.
    pub fn from_str_name(value: &str) -> ::core::option::Option<Self> {
        match value {
            "TASK_ACTIVATION_STATUS_UNSPECIFIED" => Some(Self::Unspecified),
            "TASK_ACTIVATION_STATUS_PENDING" => Some(Self::Pending),
            "TASK_ACTIVATION_STATUS_PROCESSING" => Some(Self::Processing),
            "TASK_ACTIVATION_STATUS_FAILURE" => Some(Self::Failure),
            "TASK_ACTIVATION_STATUS_RETRY" => Some(Self::Retry),
            "TASK_ACTIVATION_STATUS_COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }
}
include!("taskbroker.v1.tonic.rs");
// @@protoc_insertion_point(module)
