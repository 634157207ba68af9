use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Payload codec shared by the publish path and the ticket handler.
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Into::into)
    }

    pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(Into::into)
    }
}
