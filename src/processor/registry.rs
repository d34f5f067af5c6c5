//! Message registry, codec and dispatch.
//!
//! Configuration happens on a [`ProcessorBuilder`]; `build()` freezes the
//! registry into an `Arc`, after which [`Processor`] is cheap to clone and
//! safe to use from every agent without locking.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::context::RouteContext;
use super::message::{AnyMessage, Message};
use crate::error::{NetError, Result};
use crate::logger::{default_logger, SharedLogger};
use crate::protocol::{ByteOrder, MSG_ID_SIZE};
use crate::router::RouterHandle;

/// Typed handler, stored type-erased.
pub type Handler = Arc<dyn Fn(&dyn AnyMessage, &RouteContext) + Send + Sync>;

/// Raw handler: `(id, bytes, context)`.
pub type RawHandler = Arc<dyn Fn(u16, &Bytes, &RouteContext) + Send + Sync>;

type DecodeFn = fn(&[u8]) -> Result<Box<dyn AnyMessage>>;

fn decode_boxed<T: Message>(body: &[u8]) -> Result<Box<dyn AnyMessage>> {
    Ok(Box::new(T::decode(body)?))
}

struct MsgInfo {
    name: &'static str,
    decode: DecodeFn,
    handler: Option<Handler>,
    raw_handler: Option<RawHandler>,
    raw_merged_handler: Option<RawHandler>,
    router: Option<RouterHandle>,
}

#[derive(Default)]
struct Registry {
    byte_order: ByteOrder,
    infos: BTreeMap<u16, MsgInfo>,
    ids: HashMap<TypeId, u16>,
    names: HashMap<&'static str, u16>,
}

/// A frame with its identifier, as handed to raw handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u16,
    /// Body only for raw handlers; the whole frame for raw-merged handlers.
    pub data: Bytes,
}

/// Result of [`Processor::unmarshal`].
#[derive(Debug)]
pub enum Decoded {
    Raw(RawMessage),
    Message(Box<dyn AnyMessage>),
}

impl Decoded {
    pub fn into_message(self) -> Option<Box<dyn AnyMessage>> {
        match self {
            Decoded::Message(msg) => Some(msg),
            Decoded::Raw(_) => None,
        }
    }

    pub fn into_raw(self) -> Option<RawMessage> {
        match self {
            Decoded::Raw(raw) => Some(raw),
            Decoded::Message(_) => None,
        }
    }
}

/// Setup phase of a [`Processor`].
///
/// Misconfiguration (duplicate registration, attaching to an unregistered
/// message) is a programmer error: it is reported through
/// [`Logger::fatal`](crate::logger::Logger::fatal), which panics.
///
/// ```
/// use leafnet::msgpack_message;
/// use leafnet::processor::ProcessorBuilder;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Hello {
///     name: String,
/// }
/// msgpack_message!(Hello);
///
/// let mut builder = ProcessorBuilder::default();
/// builder.register::<Hello>(1);
/// builder.set_handler::<Hello, _>(|hello, _ctx| println!("hello {}", hello.name));
/// let processor = builder.build();
///
/// assert_eq!(processor.id_of::<Hello>(), Some(1));
/// ```
pub struct ProcessorBuilder {
    registry: Registry,
    logger: SharedLogger,
}

impl ProcessorBuilder {
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            registry: Registry::default(),
            logger,
        }
    }

    pub fn set_byte_order(&mut self, byte_order: ByteOrder) -> &mut Self {
        self.registry.byte_order = byte_order;
        self
    }

    /// Bind message type `T` to `id`. Returns `id`.
    pub fn register<T: Message>(&mut self, id: u16) -> u16 {
        let type_id = TypeId::of::<T>();
        if self.registry.ids.contains_key(&type_id) || self.registry.names.contains_key(T::NAME) {
            self.logger
                .fatal(format_args!("message {} is already registered", T::NAME));
        }
        if self.registry.infos.contains_key(&id) {
            self.logger
                .fatal(format_args!("message id {} is already registered", id));
        }

        self.registry.infos.insert(
            id,
            MsgInfo {
                name: T::NAME,
                decode: decode_boxed::<T>,
                handler: None,
                raw_handler: None,
                raw_merged_handler: None,
                router: None,
            },
        );
        self.registry.ids.insert(type_id, id);
        self.registry.names.insert(T::NAME, id);
        id
    }

    /// Call `handler` for every decoded `T`.
    pub fn set_handler<T, F>(&mut self, handler: F) -> &mut Self
    where
        T: Message,
        F: Fn(&T, &RouteContext) + Send + Sync + 'static,
    {
        let info = self.info_of::<T>();
        info.handler = Some(Arc::new(move |msg: &dyn AnyMessage, ctx: &RouteContext| {
            if let Some(msg) = msg.downcast_ref::<T>() {
                handler(msg, ctx);
            }
        }));
        self
    }

    /// Hand every decoded `T` to `router`.
    pub fn set_router<T: Message>(&mut self, router: RouterHandle) -> &mut Self {
        self.info_of::<T>().router = Some(router);
        self
    }

    /// Deliver frames with `id` undecoded, identifier stripped.
    pub fn set_raw_handler<F>(&mut self, id: u16, handler: F) -> &mut Self
    where
        F: Fn(u16, &Bytes, &RouteContext) + Send + Sync + 'static,
    {
        self.info_of_id(id).raw_handler = Some(Arc::new(handler));
        self
    }

    /// Deliver frames with `id` undecoded, identifier included.
    pub fn set_raw_merged_handler<F>(&mut self, id: u16, handler: F) -> &mut Self
    where
        F: Fn(u16, &Bytes, &RouteContext) + Send + Sync + 'static,
    {
        self.info_of_id(id).raw_merged_handler = Some(Arc::new(handler));
        self
    }

    fn info_of<T: Message>(&mut self) -> &mut MsgInfo {
        let Some(&id) = self.registry.ids.get(&TypeId::of::<T>()) else {
            self.logger
                .fatal(format_args!("message {} not registered", T::NAME));
        };
        self.info_of_id(id)
    }

    fn info_of_id(&mut self, id: u16) -> &mut MsgInfo {
        let logger = &self.logger;
        match self.registry.infos.get_mut(&id) {
            Some(info) => info,
            None => logger.fatal(format_args!("message id {} not registered", id)),
        }
    }

    /// Freeze the registry.
    pub fn build(self) -> Processor {
        Processor {
            registry: Arc::new(self.registry),
        }
    }
}

impl Default for ProcessorBuilder {
    fn default() -> Self {
        Self::new(default_logger())
    }
}

/// Frozen registry + codec + dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Processor {
    registry: Arc<Registry>,
}

impl Processor {
    pub fn builder(logger: SharedLogger) -> ProcessorBuilder {
        ProcessorBuilder::new(logger)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.registry.byte_order
    }

    /// Identifier registered for `T`.
    pub fn id_of<T: Message>(&self) -> Option<u16> {
        self.registry.ids.get(&TypeId::of::<T>()).copied()
    }

    /// Decode one frame (`id + body`).
    ///
    /// The shape depends on what is attached to the identifier: a raw
    /// handler gets the body, else a raw-merged handler gets the whole
    /// frame, else the body is decoded into the registered type.
    pub fn unmarshal(&self, frame: Bytes) -> Result<Decoded> {
        let id = self.registry.byte_order.decode_id(&frame).ok_or_else(|| {
            NetError::Protocol(format!("frame too short: {} bytes", frame.len()))
        })?;
        let info = self
            .registry
            .infos
            .get(&id)
            .ok_or(NetError::UnknownMessageId(id))?;

        if info.raw_handler.is_some() {
            Ok(Decoded::Raw(RawMessage {
                id,
                data: frame.slice(MSG_ID_SIZE..),
            }))
        } else if info.raw_merged_handler.is_some() {
            Ok(Decoded::Raw(RawMessage { id, data: frame }))
        } else {
            Ok(Decoded::Message((info.decode)(&frame[MSG_ID_SIZE..])?))
        }
    }

    /// Encode `msg` as an identifier and a body, ready for a vectored write.
    pub fn marshal(&self, msg: &dyn AnyMessage) -> Result<([u8; MSG_ID_SIZE], Bytes)> {
        let id = self.id_of_dyn(msg)?;
        let body = msg.encode_body()?;
        Ok((self.registry.byte_order.encode_id(id), Bytes::from(body)))
    }

    /// Encode `msg` as one contiguous frame.
    pub fn marshal_merged(&self, msg: &dyn AnyMessage) -> Result<Bytes> {
        let (id, body) = self.marshal(msg)?;
        let mut frame = BytesMut::with_capacity(MSG_ID_SIZE + body.len());
        frame.extend_from_slice(&id);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    fn id_of_dyn(&self, msg: &dyn AnyMessage) -> Result<u16> {
        self.registry
            .ids
            .get(&Any::type_id(msg.as_any()))
            .copied()
            .ok_or_else(|| NetError::NotRegistered(msg.name().to_string()))
    }

    /// Invoke every dispatch target attached to the message.
    ///
    /// Raw messages go to the raw handler, then the raw-merged handler.
    /// Structured messages go to the typed handler, then to the router.
    /// The router hand-off never blocks; a full router queue is returned as
    /// `RouterFull` after the handler has already run.
    pub fn route(&self, decoded: Decoded, ctx: &RouteContext) -> Result<()> {
        match decoded {
            Decoded::Raw(raw) => {
                let info = self
                    .registry
                    .infos
                    .get(&raw.id)
                    .ok_or(NetError::UnknownMessageId(raw.id))?;
                if let Some(handler) = &info.raw_handler {
                    handler(raw.id, &raw.data, ctx);
                }
                if let Some(handler) = &info.raw_merged_handler {
                    handler(raw.id, &raw.data, ctx);
                }
                Ok(())
            }
            Decoded::Message(msg) => {
                let id = self.id_of_dyn(&*msg)?;
                let info = self
                    .registry
                    .infos
                    .get(&id)
                    .ok_or(NetError::UnknownMessageId(id))?;
                if let Some(handler) = &info.handler {
                    handler(&*msg, ctx);
                }
                if let Some(router) = &info.router {
                    router.submit(info.name, msg, ctx.clone())?;
                }
                Ok(())
            }
        }
    }

    /// Visit every registration in ascending identifier order.
    pub fn range<F: FnMut(u16, &'static str)>(&self, mut f: F) {
        for (id, info) in &self.registry.infos {
            f(*id, info.name);
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("byte_order", &self.registry.byte_order)
            .field("messages", &self.registry.infos.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    struct Ping {
        value: i32,
    }

    impl Message for Ping {
        const NAME: &'static str = "Ping";

        fn encode(&self) -> Result<Vec<u8>> {
            Ok(self.value.to_be_bytes().to_vec())
        }

        fn decode(body: &[u8]) -> Result<Self> {
            let bytes: [u8; 4] = body
                .try_into()
                .map_err(|_| NetError::Protocol("ping body must be 4 bytes".into()))?;
            Ok(Ping {
                value: i32::from_be_bytes(bytes),
            })
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Login {
        account: String,
        level: u16,
    }
    crate::msgpack_message!(Login);

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Unregistered;
    crate::msgpack_message!(Unregistered);

    fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new(Arc::new(NoopLogger))
    }

    #[test]
    fn test_ping_scenario() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut builder = builder();
        builder.register::<Ping>(1);
        builder.set_handler::<Ping, _>({
            let calls = calls.clone();
            move |ping, _ctx| calls.lock().unwrap().push(ping.value)
        });
        let processor = builder.build();

        let frame = Bytes::from_static(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x07]);
        let decoded = processor.unmarshal(frame).unwrap();
        processor.route(decoded, &RouteContext::new()).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_marshal_unmarshal() {
        let mut builder = builder();
        builder.register::<Login>(10);
        let processor = builder.build();

        let login = Login {
            account: "leaf".to_string(),
            level: 3,
        };
        let (id, body) = processor.marshal(&login).unwrap();
        assert_eq!(id, [0, 10]);

        let merged = processor.marshal_merged(&login).unwrap();
        assert_eq!(&merged[..2], &id);
        assert_eq!(&merged[2..], &body[..]);

        let decoded = processor.unmarshal(merged).unwrap().into_message().unwrap();
        assert_eq!(decoded.name(), "Login");
        assert_eq!(decoded.downcast_ref::<Login>(), Some(&login));
    }

    #[test]
    fn test_little_endian_ids() {
        let mut builder = builder();
        builder.set_byte_order(ByteOrder::LittleEndian);
        builder.register::<Ping>(0x0102);
        let processor = builder.build();

        let (id, body) = processor.marshal(&Ping { value: -1 }).unwrap();
        assert_eq!(id, [0x02, 0x01]);
        assert_eq!(&body[..], &[0xFF; 4]);
        assert_eq!(processor.byte_order(), ByteOrder::LittleEndian);

        let frame = Bytes::from_static(&[0x02, 0x01, 0, 0, 0, 1]);
        let msg = processor.unmarshal(frame).unwrap().into_message().unwrap();
        assert_eq!(msg.downcast_ref::<Ping>(), Some(&Ping { value: 1 }));
    }

    #[test]
    #[should_panic(expected = "message Ping is already registered")]
    fn test_duplicate_type_is_fatal() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        builder.register::<Ping>(2);
    }

    #[test]
    #[should_panic(expected = "message id 1 is already registered")]
    fn test_duplicate_id_is_fatal() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        builder.register::<Login>(1);
    }

    #[test]
    #[should_panic(expected = "message Ping not registered")]
    fn test_handler_on_unregistered_type_is_fatal() {
        builder().set_handler::<Ping, _>(|_, _| {});
    }

    #[test]
    #[should_panic(expected = "message id 9 not registered")]
    fn test_raw_handler_on_unregistered_id_is_fatal() {
        builder().set_raw_handler(9, |_, _, _| {});
    }

    #[test]
    #[should_panic(expected = "message id 9 not registered")]
    fn test_raw_merged_handler_on_unregistered_id_is_fatal() {
        builder().set_raw_merged_handler(9, |_, _, _| {});
    }

    #[test]
    fn test_marshal_unregistered_is_error() {
        let processor = builder().build();
        let result = processor.marshal(&Unregistered);
        assert!(matches!(result, Err(NetError::NotRegistered(name)) if name == "Unregistered"));
        assert!(processor.marshal_merged(&Unregistered).is_err());
    }

    #[test]
    fn test_unmarshal_unknown_id_is_error() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        let processor = builder.build();

        let result = processor.unmarshal(Bytes::from_static(&[0, 2, 0, 0, 0, 0]));
        assert!(matches!(result, Err(NetError::UnknownMessageId(2))));
    }

    #[test]
    fn test_unmarshal_short_frame_is_error() {
        let processor = builder().build();
        let result = processor.unmarshal(Bytes::from_static(&[1]));
        assert!(matches!(result, Err(NetError::Protocol(_))));
    }

    #[test]
    fn test_unmarshal_bad_body_is_error() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        let processor = builder.build();

        assert!(processor
            .unmarshal(Bytes::from_static(&[0, 1, 0, 0]))
            .is_err());
    }

    #[test]
    fn test_raw_handler_gets_body() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        builder.set_raw_handler(1, |_, _, _| {});
        let processor = builder.build();

        let raw = processor
            .unmarshal(Bytes::from_static(&[0, 1, 9, 9]))
            .unwrap()
            .into_raw()
            .unwrap();
        assert_eq!(raw.id, 1);
        assert_eq!(&raw.data[..], &[9, 9]);
    }

    #[test]
    fn test_raw_merged_handler_gets_whole_frame() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        builder.set_raw_merged_handler(1, |_, _, _| {});
        let processor = builder.build();

        let raw = processor
            .unmarshal(Bytes::from_static(&[0, 1, 9, 9]))
            .unwrap()
            .into_raw()
            .unwrap();
        assert_eq!(&raw.data[..], &[0, 1, 9, 9]);
    }

    #[test]
    fn test_both_raw_handlers_fire_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut builder = builder();
        builder.register::<Ping>(1);
        builder.set_raw_handler(1, {
            let calls = calls.clone();
            move |id, data, _| calls.lock().unwrap().push(("raw", id, data.to_vec()))
        });
        builder.set_raw_merged_handler(1, {
            let calls = calls.clone();
            move |id, data, _| calls.lock().unwrap().push(("merged", id, data.to_vec()))
        });
        let processor = builder.build();

        let decoded = processor.unmarshal(Bytes::from_static(&[0, 1, 5])).unwrap();
        processor.route(decoded, &RouteContext::new()).unwrap();

        // Raw handler wins the shape; both see the stripped body.
        assert_eq!(
            *calls.lock().unwrap(),
            vec![("raw", 1, vec![5]), ("merged", 1, vec![5])]
        );
    }

    #[test]
    fn test_route_unregistered_is_error() {
        let processor = builder().build();

        let result = processor.route(Decoded::Message(Box::new(Unregistered)), &RouteContext::new());
        assert!(matches!(result, Err(NetError::NotRegistered(_))));

        let raw = Decoded::Raw(RawMessage {
            id: 4,
            data: Bytes::new(),
        });
        assert!(matches!(
            processor.route(raw, &RouteContext::new()),
            Err(NetError::UnknownMessageId(4))
        ));
    }

    #[test]
    fn test_route_without_targets_is_ok() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        let processor = builder.build();

        processor
            .route(Decoded::Message(Box::new(Ping { value: 1 })), &RouteContext::new())
            .unwrap();
    }

    #[test]
    fn test_range_ascending() {
        let mut builder = builder();
        builder.register::<Login>(7);
        builder.register::<Ping>(3);
        let processor = builder.build();

        let mut seen = Vec::new();
        processor.range(|id, name| seen.push((id, name)));
        assert_eq!(seen, vec![(3, "Ping"), (7, "Login")]);
        assert_eq!(processor.id_of::<Login>(), Some(7));
        assert_eq!(processor.id_of::<Unregistered>(), None);
    }

    #[test]
    fn test_processor_shared_across_threads() {
        let mut builder = builder();
        builder.register::<Ping>(1);
        let processor = builder.build();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let processor = processor.clone();
                std::thread::spawn(move || {
                    let frame = processor.marshal_merged(&Ping { value: i }).unwrap();
                    let msg = processor.unmarshal(frame).unwrap().into_message().unwrap();
                    msg.downcast_ref::<Ping>().map(|p| p.value)
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), Some(i as i32));
        }
    }
}
