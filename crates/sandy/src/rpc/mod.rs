//! Line-delimited JSON messaging with bidirectional request/response.

mod channel;
pub mod codec;
mod endpoint;
mod message;

pub use channel::{BoxedReader, BoxedWriter, ChannelError, MessageReader, MessageWriter};
pub use codec::FramingError;
pub use endpoint::{Endpoint, RequestContext, Service};
pub use message::{Message, RequestId, RpcError};
