//! Task payload encoding
//!
//! Tasks travel as JSON documents. Equality of tasks is structural, so field
//! order in the encoded bytes carries no meaning.

use crate::error::QueueResult;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn encode<T: Serialize + ?Sized>(task: &T) -> QueueResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(task)?))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> QueueResult<T> {
    Ok(serde_json::from_slice(payload)?)
}
