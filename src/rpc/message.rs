//! RPC envelope layout.
//!
//! Every packet exchanged by client and server starts with a one-byte
//! message type and a little-endian request id:
//!
//! - `REQUEST`: followed by the method address (object name, method name,
//!   signature hash), the caller's serialized context, and the argument
//!   tuple.
//! - `RESPONSE`: followed by a [`ResultHolder`](crate::wire::ResultHolder).
//! - `CANCEL_REQUEST`: nothing further.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::rpc::interface::MethodDescriptor;
use crate::wire::{self, Wire, WireReader};

/// Identifies one in-flight call, unique per client connection.
pub type RequestId = u32;

/// The kind of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A method invocation.
    Request = 1,
    /// The outcome of an invocation.
    Response = 2,
    /// Best-effort notice that a request was abandoned.
    CancelRequest = 3,
}

impl Wire for MessageType {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.byte()? {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::CancelRequest),
            other => Err(Error::data_mismatch(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

/// The fixed envelope prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The envelope kind.
    pub message_type: MessageType,
    /// The request this envelope belongs to.
    pub request_id: RequestId,
}

impl Wire for Header {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.message_type.encode(buf);
        self.request_id.encode(buf);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            message_type: MessageType::decode(r)?,
            request_id: RequestId::decode(r)?,
        })
    }
}

/// Builds a REQUEST envelope.
pub fn encode_request<Args: Wire>(
    request_id: RequestId,
    object_name: &str,
    method: &MethodDescriptor,
    ctx: &Context,
    args: &Args,
) -> Vec<u8> {
    let mut buf = Vec::new();
    Header {
        message_type: MessageType::Request,
        request_id,
    }
    .encode(&mut buf);
    wire::encode_str(object_name, &mut buf);
    wire::encode_str(method.name, &mut buf);
    method.hash.encode(&mut buf);
    ctx.encode_wire(&mut buf);
    args.encode(&mut buf);
    buf
}

/// Builds a RESPONSE envelope around already-encoded result bytes.
#[must_use]
pub fn encode_response(request_id: RequestId, result_bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(result_bytes.len() + 5);
    Header {
        message_type: MessageType::Response,
        request_id,
    }
    .encode(&mut buf);
    buf.extend_from_slice(result_bytes);
    buf
}

/// Builds a CANCEL_REQUEST envelope.
#[must_use]
pub fn encode_cancel(request_id: RequestId) -> Vec<u8> {
    let mut buf = Vec::new();
    Header {
        message_type: MessageType::CancelRequest,
        request_id,
    }
    .encode(&mut buf);
    buf
}
