//! MsgPack codec using `rmp-serde`.
//!
//! Structs are encoded with `to_vec_named` (struct-as-map), so peers written
//! against field names keep working when fields are reordered or added.
//!
//! # Example
//!
//! ```
//! use leafnet::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Login {
//!     account: String,
//!     token: u64,
//! }
//!
//! let msg = Login { account: "leaf".to_string(), token: 42 };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Login = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for message bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
