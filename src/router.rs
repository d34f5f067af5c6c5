//! Fire-and-forget hand-off of decoded messages to a single consumer.
//!
//! The processor submits through a [`RouterHandle`] and never waits: the
//! queue is bounded and a full queue drops the message with `RouterFull`.
//! The [`Router`] owns the receiving end and runs registered handlers one
//! at a time, in arrival order, on whatever task drives [`Router::run`].
//!
//! ```
//! use std::sync::Arc;
//! use leafnet::logger::NoopLogger;
//! use leafnet::msgpack_message;
//! use leafnet::processor::RouteContext;
//! use leafnet::router::Router;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Enter {
//!     room: u32,
//! }
//! msgpack_message!(Enter);
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (mut router, handle) = Router::new(64, Arc::new(NoopLogger));
//! router.register::<Enter, _>(|enter, _ctx| println!("enter room {}", enter.room));
//!
//! handle.submit("Enter", Box::new(Enter { room: 3 }), RouteContext::new()).unwrap();
//! drop(handle);
//! router.run().await;
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{NetError, Result};
use crate::logger::SharedLogger;
use crate::processor::{AnyMessage, Message, RouteContext};

/// Default router queue capacity.
pub const DEFAULT_ROUTER_CAPACITY: usize = 10_000;

struct Call {
    name: &'static str,
    msg: Box<dyn AnyMessage>,
    ctx: RouteContext,
}

type RouteFn = Box<dyn FnMut(Box<dyn AnyMessage>, RouteContext) + Send>;

/// Submitting side of a router. Cheap to clone.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Call>,
}

impl RouterHandle {
    /// Queue `msg` for the router without waiting.
    ///
    /// # Errors
    ///
    /// - `RouterFull` if the queue is at capacity (the message is dropped)
    /// - `RouterClosed` if the router is gone
    pub fn submit(&self, name: &'static str, msg: Box<dyn AnyMessage>, ctx: RouteContext) -> Result<()> {
        self.tx
            .try_send(Call { name, msg, ctx })
            .map_err(|e| match e {
                TrySendError::Full(_) => NetError::RouterFull(name.to_string()),
                TrySendError::Closed(_) => NetError::RouterClosed,
            })
    }

    /// Whether the router has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterHandle")
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

/// Single-consumer executor for routed messages.
pub struct Router {
    rx: mpsc::Receiver<Call>,
    routes: HashMap<&'static str, RouteFn>,
    logger: SharedLogger,
}

impl Router {
    /// Create a router whose queue holds at most `capacity` messages.
    pub fn new(capacity: usize, logger: SharedLogger) -> (Self, RouterHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let router = Self {
            rx,
            routes: HashMap::new(),
            logger,
        };
        (router, RouterHandle { tx })
    }

    /// Run `f` for every routed `T`. Registering a type twice is fatal.
    pub fn register<T, F>(&mut self, mut f: F) -> &mut Self
    where
        T: Message,
        F: FnMut(T, RouteContext) + Send + 'static,
    {
        if self.routes.contains_key(T::NAME) {
            self.logger
                .fatal(format_args!("router: function {} is already registered", T::NAME));
        }

        let logger = self.logger.clone();
        self.routes.insert(
            T::NAME,
            Box::new(move |msg: Box<dyn AnyMessage>, ctx: RouteContext| match msg.downcast::<T>() {
                Some(msg) => f(*msg, ctx),
                None => logger.error(format_args!("router: {} carried another type", T::NAME)),
            }),
        );
        self
    }

    /// Process messages until every [`RouterHandle`] is dropped.
    pub async fn run(mut self) {
        while let Some(call) = self.rx.recv().await {
            self.dispatch(call);
        }
    }

    /// Process whatever is queued right now without waiting. Returns the
    /// number of messages handled.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(call) = self.rx.try_recv() {
            self.dispatch(call);
            handled += 1;
        }
        handled
    }

    fn dispatch(&mut self, call: Call) {
        match self.routes.get_mut(call.name) {
            Some(route) => route(call.msg, call.ctx),
            None => self
                .logger
                .error(format_args!("router: function {} not registered", call.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::processor::ProcessorBuilder;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Attack {
        target: u32,
    }
    crate::msgpack_message!(Attack);

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Heal {
        amount: u32,
    }
    crate::msgpack_message!(Heal);

    fn router(capacity: usize) -> (Router, RouterHandle) {
        Router::new(capacity, Arc::new(NoopLogger))
    }

    #[tokio::test]
    async fn test_run_in_arrival_order() {
        let (mut router, handle) = router(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.register::<Attack, _>({
            let seen = seen.clone();
            move |attack, _| seen.lock().unwrap().push(attack.target)
        });

        for target in 0..5 {
            handle
                .submit("Attack", Box::new(Attack { target }), RouteContext::new())
                .unwrap();
        }
        drop(handle);
        router.run().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_full_queue_drops() {
        let (_router, handle) = router(1);

        handle
            .submit("Attack", Box::new(Attack { target: 1 }), RouteContext::new())
            .unwrap();
        let result = handle.submit("Attack", Box::new(Attack { target: 2 }), RouteContext::new());

        assert!(matches!(result, Err(NetError::RouterFull(name)) if name == "Attack"));
    }

    #[test]
    fn test_closed_router() {
        let (router, handle) = router(4);
        drop(router);

        assert!(handle.is_closed());
        let result = handle.submit("Heal", Box::new(Heal { amount: 1 }), RouteContext::new());
        assert!(matches!(result, Err(NetError::RouterClosed)));
    }

    #[test]
    #[should_panic(expected = "router: function Heal is already registered")]
    fn test_duplicate_register_is_fatal() {
        let (mut router, _handle) = router(4);
        router.register::<Heal, _>(|_, _| {});
        router.register::<Heal, _>(|_, _| {});
    }

    #[test]
    fn test_unknown_and_mismatched_calls_skipped() {
        let (mut router, handle) = router(4);
        let healed = Arc::new(Mutex::new(0));
        router.register::<Heal, _>({
            let healed = healed.clone();
            move |heal, _| *healed.lock().unwrap() += heal.amount
        });

        handle
            .submit("Attack", Box::new(Attack { target: 1 }), RouteContext::new())
            .unwrap();
        handle
            .submit("Heal", Box::new(Attack { target: 1 }), RouteContext::new())
            .unwrap();
        handle
            .submit("Heal", Box::new(Heal { amount: 5 }), RouteContext::new())
            .unwrap();

        assert_eq!(router.run_pending(), 3);
        assert_eq!(*healed.lock().unwrap(), 5);
    }

    #[test]
    fn test_processor_hands_off_after_handler() {
        let (mut router, handle) = router(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut builder = ProcessorBuilder::new(Arc::new(NoopLogger));
        builder.register::<Attack>(2);
        builder.set_handler::<Attack, _>({
            let order = order.clone();
            move |attack, _| order.lock().unwrap().push(("handler", attack.target))
        });
        builder.set_router::<Attack>(handle);
        let processor = builder.build();

        router.register::<Attack, _>({
            let order = order.clone();
            move |attack, _| order.lock().unwrap().push(("router", attack.target))
        });

        let frame = processor.marshal_merged(&Attack { target: 8 }).unwrap();
        let decoded = processor.unmarshal(frame).unwrap();
        processor.route(decoded, &RouteContext::new()).unwrap();

        // Nothing ran on the router side yet: the hand-off is asynchronous.
        assert_eq!(*order.lock().unwrap(), vec![("handler", 8)]);

        router.run_pending();
        assert_eq!(*order.lock().unwrap(), vec![("handler", 8), ("router", 8)]);
    }

    #[test]
    fn test_processor_reports_full_router() {
        let (_router, handle) = router(1);

        let mut builder = ProcessorBuilder::new(Arc::new(NoopLogger));
        builder.register::<Heal>(1);
        builder.set_router::<Heal>(handle);
        let processor = builder.build();

        let frame = processor.marshal_merged(&Heal { amount: 1 }).unwrap();
        let first = processor.unmarshal(frame.clone()).unwrap();
        processor.route(first, &RouteContext::new()).unwrap();

        let second = processor.unmarshal(frame).unwrap();
        let result = processor.route(second, &RouteContext::new());
        assert!(matches!(result, Err(NetError::RouterFull(_))));
    }
}
