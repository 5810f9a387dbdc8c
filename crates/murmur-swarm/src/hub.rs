//! Tell and ask hubs.
//!
//! A hub is the rendezvous between a deliverer (the swarm's receive path)
//! and the single serving consumer. The handoff queue is bounded at one
//! message, so `deliver` exerts backpressure when the consumer falls
//! behind. `close_with_error` fails current and future deliveries and makes
//! the consumer side return the same error.

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::swarm::{Message, SwarmError};

/// Handoff point for one-way datagrams.
pub struct TellHub<A> {
    tx: mpsc::Sender<Message<A>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message<A>>>,
    closed_tx: watch::Sender<bool>,
    err: Mutex<Option<SwarmError>>,
}

impl<A: Send> TellHub<A> {
    /// Creates an open hub.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (closed_tx, _) = watch::channel(false);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed_tx,
            err: Mutex::new(None),
        }
    }

    /// Hands a message to the consumer, blocking until there is room.
    pub async fn deliver(&self, msg: Message<A>) -> Result<(), SwarmError> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return Err(self.close_error());
        }
        tokio::select! {
            res = self.tx.send(msg) => res.map_err(|_| self.close_error()),
            _ = closed.wait_for(|c| *c) => Err(self.close_error()),
        }
    }

    /// Takes the next delivered message.
    pub async fn recv(&self) -> Result<Message<A>, SwarmError> {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed_tx.subscribe();
        tokio::select! {
            msg = rx.recv() => msg.ok_or_else(|| self.close_error()),
            _ = closed.wait_for(|c| *c) => Err(self.close_error()),
        }
    }

    /// Fails current and future deliveries with `err`. The first error
    /// sticks; later calls are no-ops.
    pub fn close_with_error(&self, err: SwarmError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        let _ = self.closed_tx.send(true);
    }

    /// Returns true once the hub has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn close_error(&self) -> SwarmError {
        self.err.lock().clone().unwrap_or(SwarmError::Closed)
    }
}

impl<A: Send> Default for TellHub<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// An inbound request paired with its reply channel.
pub struct AskRequest<A> {
    /// The request datagram
    pub msg: Message<A>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl<A> AskRequest<A> {
    /// Sends the reply back to the asker. Dropping the request without
    /// responding fails the ask on the caller's side.
    pub fn respond(self, payload: Vec<u8>) {
        let _ = self.reply.send(payload);
    }

    /// Splits the request into the message and a detached reply handle.
    pub fn into_parts(self) -> (Message<A>, ReplyHandle) {
        (self.msg, ReplyHandle(self.reply))
    }
}

/// Detached handle for replying to an [`AskRequest`].
pub struct ReplyHandle(oneshot::Sender<Vec<u8>>);

impl ReplyHandle {
    /// Sends the reply back to the asker.
    pub fn respond(self, payload: Vec<u8>) {
        let _ = self.0.send(payload);
    }
}

/// Handoff point for request/response exchanges.
pub struct AskHub<A> {
    tx: mpsc::Sender<AskRequest<A>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<AskRequest<A>>>,
    closed_tx: watch::Sender<bool>,
    err: Mutex<Option<SwarmError>>,
}

impl<A: Send> AskHub<A> {
    /// Creates an open hub.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (closed_tx, _) = watch::channel(false);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed_tx,
            err: Mutex::new(None),
        }
    }

    /// Hands a request to the consumer and waits for its reply.
    pub async fn deliver(&self, msg: Message<A>) -> Result<Vec<u8>, SwarmError> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return Err(self.close_error());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = AskRequest {
            msg,
            reply: reply_tx,
        };
        tokio::select! {
            res = self.tx.send(req) => {
                res.map_err(|_| self.close_error())?;
            }
            _ = closed.wait_for(|c| *c) => return Err(self.close_error()),
        }
        tokio::select! {
            reply = reply_rx => {
                reply.map_err(|_| SwarmError::Transport("ask dropped without reply".into()))
            }
            _ = closed.wait_for(|c| *c) => Err(self.close_error()),
        }
    }

    /// Takes the next delivered request.
    pub async fn recv(&self) -> Result<AskRequest<A>, SwarmError> {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed_tx.subscribe();
        tokio::select! {
            req = rx.recv() => req.ok_or_else(|| self.close_error()),
            _ = closed.wait_for(|c| *c) => Err(self.close_error()),
        }
    }

    /// Fails current and future deliveries with `err`.
    pub fn close_with_error(&self, err: SwarmError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        let _ = self.closed_tx.send(true);
    }

    /// Returns true once the hub has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn close_error(&self) -> SwarmError {
        self.err.lock().clone().unwrap_or(SwarmError::Closed)
    }
}

impl<A: Send> Default for AskHub<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn msg(payload: &[u8]) -> Message<u32> {
        Message {
            src: 1,
            dst: 2,
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_tell_hub_handoff() {
        let hub = TellHub::new();
        hub.deliver(msg(b"one")).await.unwrap();
        let got = hub.recv().await.unwrap();
        assert_eq!(got.payload, b"one");
    }

    #[tokio::test]
    async fn test_tell_hub_backpressure() {
        let hub = Arc::new(TellHub::new());
        // First deliver fills the single slot; the second must wait for recv.
        hub.deliver(msg(b"a")).await.unwrap();

        let hub2 = hub.clone();
        let pending = tokio::spawn(async move { hub2.deliver(msg(b"b")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        assert_eq!(hub.recv().await.unwrap().payload, b"a");
        pending.await.unwrap().unwrap();
        assert_eq!(hub.recv().await.unwrap().payload, b"b");
    }

    #[tokio::test]
    async fn test_tell_hub_close_fails_both_sides() {
        let hub: TellHub<u32> = TellHub::new();
        hub.close_with_error(SwarmError::Closed);
        assert_eq!(hub.deliver(msg(b"x")).await, Err(SwarmError::Closed));
        assert_eq!(hub.recv().await.unwrap_err(), SwarmError::Closed);
    }

    #[tokio::test]
    async fn test_tell_hub_close_wakes_blocked_deliver() {
        let hub = Arc::new(TellHub::new());
        hub.deliver(msg(b"a")).await.unwrap();
        let hub2 = hub.clone();
        let pending = tokio::spawn(async move { hub2.deliver(msg(b"b")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        hub.close_with_error(SwarmError::Transport("torn down".into()));
        assert!(pending.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_tell_hub_first_error_sticks() {
        let hub: TellHub<u32> = TellHub::new();
        hub.close_with_error(SwarmError::Transport("first".into()));
        hub.close_with_error(SwarmError::Closed);
        assert_eq!(
            hub.recv().await.unwrap_err(),
            SwarmError::Transport("first".into())
        );
    }

    #[tokio::test]
    async fn test_ask_hub_roundtrip() {
        let hub = Arc::new(AskHub::new());
        let hub2 = hub.clone();
        let server = tokio::spawn(async move {
            let req = hub2.recv().await.unwrap();
            assert_eq!(req.msg.payload, b"ping");
            req.respond(b"pong".to_vec());
        });
        let reply = hub.deliver(msg(b"ping")).await.unwrap();
        assert_eq!(reply, b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ask_hub_dropped_request_fails_asker() {
        let hub = Arc::new(AskHub::new());
        let hub2 = hub.clone();
        let server = tokio::spawn(async move {
            let req = hub2.recv().await.unwrap();
            drop(req);
        });
        let res = hub.deliver(msg(b"ping")).await;
        assert!(matches!(res, Err(SwarmError::Transport(_))));
        server.await.unwrap();
    }
}
