//! Command router with a middleware chain and pooled, session-aware
//! contexts.
//!
//! Registration happens once at startup (`&mut self`); serving is
//! re-entrant. Each request checks a context out of the pool, runs the
//! handler chain gin-style (every handler may call [`Context::next`] at most
//! once; [`Context::abort`] stops the remainder) and returns the context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use hermod_proto::messages::{ErrorResp, Session};
use hermod_proto::{Flag, Header, Packet, Status, WireError};

use crate::container::ContainerError;
use crate::dispatcher::Dispatcher;
use crate::storage::SessionStorage;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Dispatch(#[from] ContainerError),
    #[error(transparent)]
    Decode(#[from] WireError),
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &mut Context);
}

/// Per-request state handed down the handler chain.
#[derive(Default)]
pub struct Context {
    request: Packet,
    handlers: Vec<Arc<dyn Handler>>,
    index: usize,
    session: Session,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    storage: Option<Arc<dyn SessionStorage>>,
}

impl Context {
    fn reset(&mut self) {
        self.request = Packet::default();
        self.handlers.clear();
        self.index = 0;
        self.session = Session::default();
        self.dispatcher = None;
        self.storage = None;
    }

    pub fn header(&self) -> &Header {
        &self.request.header
    }

    pub fn request(&self) -> &Packet {
        &self.request
    }

    /// Decode the request body.
    pub fn read_body<M: prost::Message + Default>(&self) -> Result<M, RouterError> {
        Ok(self.request.read_body::<M>()?)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.dispatcher
            .clone()
            .expect("context is populated by Router::serve")
    }

    pub fn session_storage(&self) -> Arc<dyn SessionStorage> {
        self.storage
            .clone()
            .expect("context is populated by Router::serve")
    }

    /// Run the remainder of the handler chain.
    pub async fn next(&mut self) {
        while self.index < self.handlers.len() {
            let handler = self.handlers[self.index].clone();
            self.index += 1;
            handler.call(self).await;
        }
    }

    /// Prevent the remaining handlers from running.
    pub fn abort(&mut self) {
        self.index = self.handlers.len();
    }

    /// Respond to the originating gateway/channel with a body.
    pub async fn resp<M: prost::Message>(
        &self,
        status: Status,
        body: &M,
    ) -> Result<(), RouterError> {
        let mut packet = Packet::from_header(self.header());
        packet.flag = Flag::Response;
        packet.set_status(status);
        packet.write_body(body);
        self.push_to_origin(packet).await
    }

    /// Respond with an error status and message.
    pub async fn resp_with_error(
        &self,
        status: Status,
        message: &str,
    ) -> Result<(), RouterError> {
        let mut packet = Packet::from_header(self.header());
        packet.flag = Flag::Response;
        packet.set_status(status);
        packet.write_body(&ErrorResp { message: message.to_owned() });
        self.push_to_origin(packet).await
    }

    async fn push_to_origin(&self, packet: Packet) -> Result<(), RouterError> {
        let session = self.session();
        self.dispatcher()
            .push(&session.gate_id, &[session.channel_id.clone()], packet)
            .await?;
        Ok(())
    }
}

/// Replies `NotImplemented` for commands nothing registered.
struct NotImplementedHandler;

#[async_trait]
impl Handler for NotImplementedHandler {
    async fn call(&self, ctx: &mut Context) {
        if let Err(e) = ctx
            .resp_with_error(Status::NotImplemented, "NotImplemented")
            .await
        {
            warn!(command = %ctx.header().command, error = %e, "not-implemented response failed");
        }
    }
}

#[derive(Default)]
pub struct Router {
    middlewares: Vec<Arc<dyn Handler>>,
    handlers: HashMap<String, Vec<Arc<dyn Handler>>>,
    pool: Mutex<Vec<Context>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Append middleware applied to every command registered afterwards.
    pub fn use_middleware(&mut self, handler: Arc<dyn Handler>) {
        self.middlewares.push(handler);
    }

    /// Register a handler chain for a command: current middlewares first,
    /// then the given handlers.
    pub fn handle(&mut self, command: &str, handlers: Vec<Arc<dyn Handler>>) {
        let chain = self.handlers.entry(command.to_owned()).or_default();
        chain.extend(self.middlewares.iter().cloned());
        chain.extend(handlers);
    }

    /// Dispatch one decoded packet. Re-entrant and thread-safe.
    pub async fn serve(
        &self,
        packet: Packet,
        dispatcher: Arc<dyn Dispatcher>,
        storage: Arc<dyn SessionStorage>,
        session: Session,
    ) -> Result<(), RouterError> {
        let mut ctx = self.pool.lock().pop().unwrap_or_default();
        ctx.reset();

        ctx.handlers = match self.handlers.get(&packet.header.command) {
            Some(chain) => chain.clone(),
            None => vec![Arc::new(NotImplementedHandler)],
        };
        ctx.request = packet;
        ctx.dispatcher = Some(dispatcher);
        ctx.storage = Some(storage);
        ctx.session = session;

        ctx.next().await;

        ctx.reset();
        self.pool.lock().push(ctx);
        Ok(())
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}
