use std::sync::Arc;

use serde_json::Value;
use tokio::io::{duplex, split};

use crate::{
    error::{ProtocolError, Result},
    rpc::{Endpoint, MessageReader, MessageWriter, RequestContext, Service},
};

struct Refuse;

#[async_trait::async_trait]
impl Service for Refuse {
    async fn handle_request(&self, _ctx: RequestContext, method: &str, _params: Value) -> Result<Value> {
        Err(ProtocolError::method_not_found(method).into())
    }
}

/// Two connected endpoints that refuse every request.
pub fn endpoint_pair() -> (Endpoint, Endpoint) {
    let (a, b) = duplex(64 * 1024);
    let (ar, aw) = split(a);
    let (br, bw) = split(b);
    (
        Endpoint::attach("left", MessageReader::new(ar), MessageWriter::new(aw), Arc::new(Refuse)),
        Endpoint::attach("right", MessageReader::new(br), MessageWriter::new(bw), Arc::new(Refuse)),
    )
}
