// @generated
// This file wires up buf-generated protobuf code.
// The prost file include!()s its tonic companion.

pub mod taskbroker {
    pub mod v1 {
        include!("generated/taskbroker/v1/taskbroker.v1.rs");
    }
}
