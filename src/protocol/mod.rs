//! Wire protocol for posting a message and receiving two documents back.
//!
//! - `request`: `user=`/`img=` headers followed by the verbatim message
//! - `response`: `status=` followed by two `file=`/`len=`/body blocks

pub mod request;
pub mod response;

pub use request::{Request, RequestError};
pub use response::{
    decode_response, DecodeError, DecodeState, Document, ProtocolReason, Response,
    ResponseDecoder,
};
