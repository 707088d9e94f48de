//! Tensor query wire protocol and capability negotiation.
//!
//! # Protocol Overview
//!
//! A client offers the shape/type contract of the tensor stream it will send;
//! the server compares it with the contract of its bound pipeline segment and
//! either accepts (assigning a session id) or rejects with a reason. Data then
//! flows as session-tagged, ordinal-stamped frames.
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Server
//!    |                                  |
//!    |------ CAPABILITY (caps) ------->|  Offer stream contract
//!    |                                  |
//!    |<----- ACCEPT (id, caps) --------|  Session established
//!    |     or REJECT (reason)          |  or rejected with reason
//!    |                                  |
//!    |====== DATA (id, ordinal) ======>|  Frames to the pipeline
//!    |<===== DATA (id, ordinal) =======|  Processed frames back
//!    |                                  |
//!    |------ CLOSE (id) -------------->|  Graceful termination
//! ```
//!
//! HYBRID mode prepends a connectionless lookup:
//!
//! ```text
//! Client (UDP)                        Server (UDP, same port)
//!    |------ DISCOVER (caps) --------->|
//!    |<----- ENDPOINT (host, port) ----|  then TCP as above
//! ```
//!
//! ## Wire Format
//!
//! Every message starts with a one-byte kind; all integers are big-endian.
//!
//! | Kind       | Byte | Body                                                       |
//! |------------|------|------------------------------------------------------------|
//! | CAPABILITY | 0x01 | `nonce:u32 len:u32 caps`                                   |
//! | ACCEPT     | 0x02 | `session:u64 len:u32 caps`                                 |
//! | REJECT     | 0x03 | `reason:u8 len:u32 message`                                |
//! | DATA       | 0x04 | `session:u64 ordinal:u64 count:u8 (len:u32 bytes)*count`   |
//! | DISCOVER   | 0x05 | `len:u32 caps`                                             |
//! | ENDPOINT   | 0x06 | `port:u16 len:u32 host`                                    |
//! | CLOSE      | 0x07 | `session:u64`                                              |
//!
//! ## Rejection Reasons
//!
//! | Code | Reason         | Meaning                                 |
//! |------|----------------|-----------------------------------------|
//! | 1    | `TensorCount`  | Number of tensors differs               |
//! | 2    | `Dimension`    | A tensor dimension differs              |
//! | 3    | `Type`         | A tensor element type differs           |
//! | 4    | `Timeout`      | No offer within the negotiation window  |
//! | 5    | `Invalid`      | Malformed or duplicate offer            |

mod capabilities;
mod frame;
mod message;
mod negotiation;

pub use capabilities::{CapabilityDescriptor, TensorType, CAPS_MEDIA_TYPE, RANK_LIMIT, TENSOR_LIMIT};
pub use frame::{Frame, SequenceGuard, SessionId};
pub use message::{Message, MessageKind, RejectReason, MAX_MESSAGE_SIZE};
pub use negotiation::{NegotiationPolicy, Negotiator, DATAGRAM_HANDSHAKE_ATTEMPTS};

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.0";
