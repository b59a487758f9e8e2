//! Inter-process wire protocol for parallite
//!
//! This crate defines the two things every parallite byte stream shares:
//! length-prefixed binary framing and the MessagePack envelope format used
//! for submissions and responses. Both the client↔daemon endpoint and the
//! daemon↔worker stdio pipes speak exactly this protocol.

pub mod error;
pub mod framing;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use framing::{read_frame, write_frame, DEFAULT_MAX_PAYLOAD_BYTES};
pub use protocol::{
    encode_failure, encode_submission, encode_success, Response, Submission, WorkerReply,
    MSG_TYPE_SUBMIT,
};
pub use transport::StdioEndpoint;
