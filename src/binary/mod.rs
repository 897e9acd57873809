//! Binary wire protocol: framing, request state, and the operation queue

pub mod codec;
pub mod leb128;
pub mod opcode;
pub mod packet;
pub mod queue;
pub mod request;
pub mod server_duration;

pub use codec::Codec;
pub use opcode::{DurabilityLevel, HelloFeature, Magic, Opcode, Status};
pub use packet::{DurabilityFrame, Packet, UnsupportedFrame};
pub use queue::OperationQueue;
pub use request::{QueueCallback, QueueRequest};
