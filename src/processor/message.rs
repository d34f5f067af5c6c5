//! Message types and their type-erased view.

use std::any::Any;
use std::fmt;

use crate::error::Result;

/// A structured message that can travel in a frame body.
///
/// `NAME` is the registry key: each implementor registers to exactly one
/// identifier. Serde types get an implementation from
/// [`msgpack_message!`](crate::msgpack_message); anything else can encode
/// its body by hand.
///
/// ```
/// use leafnet::error::{NetError, Result};
/// use leafnet::processor::Message;
///
/// #[derive(Debug, PartialEq)]
/// struct Ping {
///     value: i32,
/// }
///
/// impl Message for Ping {
///     const NAME: &'static str = "Ping";
///
///     fn encode(&self) -> Result<Vec<u8>> {
///         Ok(self.value.to_be_bytes().to_vec())
///     }
///
///     fn decode(body: &[u8]) -> Result<Self> {
///         let bytes: [u8; 4] = body
///             .try_into()
///             .map_err(|_| NetError::Protocol("ping body must be 4 bytes".into()))?;
///         Ok(Ping { value: i32::from_be_bytes(bytes) })
///     }
/// }
///
/// assert_eq!(Ping::decode(&[0, 0, 0, 7]).unwrap(), Ping { value: 7 });
/// ```
pub trait Message: Send + Sync + fmt::Debug + 'static {
    const NAME: &'static str;

    /// Encode the frame body (identifier excluded).
    fn encode(&self) -> Result<Vec<u8>>;

    /// Decode a frame body.
    fn decode(body: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Object-safe view of any [`Message`].
pub trait AnyMessage: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &'static str;
    fn encode_body(&self) -> Result<Vec<u8>>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Message> AnyMessage for T {
    #[inline]
    fn name(&self) -> &'static str {
        T::NAME
    }

    #[inline]
    fn encode_body(&self) -> Result<Vec<u8>> {
        self.encode()
    }

    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn AnyMessage {
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Take ownership of the concrete message. `None` on a type mismatch.
    pub fn downcast<T: Message>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

/// Implement [`Message`] for a serde type using [`MsgPackCodec`].
///
/// The registry name defaults to the type name as written.
///
/// ```
/// use leafnet::msgpack_message;
/// use leafnet::processor::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Hello {
///     name: String,
/// }
/// msgpack_message!(Hello);
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Bye;
/// msgpack_message!(Bye, "game.Bye");
///
/// assert_eq!(Hello::NAME, "Hello");
/// assert_eq!(Bye::NAME, "game.Bye");
/// ```
///
/// [`MsgPackCodec`]: crate::codec::MsgPackCodec
#[macro_export]
macro_rules! msgpack_message {
    ($ty:ty) => {
        $crate::msgpack_message!($ty, stringify!($ty));
    };
    ($ty:ty, $name:expr) => {
        impl $crate::processor::Message for $ty {
            const NAME: &'static str = $name;

            fn encode(&self) -> $crate::error::Result<::std::vec::Vec<u8>> {
                $crate::codec::MsgPackCodec::encode(self)
            }

            fn decode(body: &[u8]) -> $crate::error::Result<Self> {
                $crate::codec::MsgPackCodec::decode(body)
            }
        }
    };
}
