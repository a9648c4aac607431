// auth-broker/src/actors/pairing_session.rs
use actix::prelude::*;
use actix_web_actors::ws;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use common::messages::BrokerReply;

use crate::dispatcher::{BrokerCore, Disposition, Outcome};
use crate::registry::SessionSink;

/// Frame pushed to this connection on behalf of its peer.
#[derive(Message)]
#[rtype(result = "()")]
pub struct PushFrame(pub String);

/// Terminal close, optionally preceded by a last frame.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseConnection(pub Option<String>);

/// Registry sink backed by the connection actor's address. `do_send` only
/// queues, so delivery to an already-stopped actor is silently dropped,
/// which is exactly the contract the registry expects.
pub struct ActorSink {
    addr: Addr<PairingSession>,
}

impl SessionSink for ActorSink {
    fn deliver(&self, frame: String) {
        self.addr.do_send(PushFrame(frame));
    }

    fn hangup(&self, last: Option<String>) {
        self.addr.do_send(CloseConnection(last));
    }
}

/// One actor per accepted WebSocket connection, for either client role.
pub struct PairingSession {
    client_id: Uuid,
    core: Arc<BrokerCore>,
    alive: bool,
}

impl PairingSession {
    pub fn new(core: Arc<BrokerCore>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            core,
            alive: true,
        }
    }

    /// Liveness: on every tick, drop the connection if the previous ping
    /// went unanswered, otherwise clear the flag and ping again. Any inbound
    /// frame restores the flag.
    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.core.config.ping_interval(), |act, ctx| {
            if !act.alive {
                tracing::warn!("client missed ping deadline: {}", act.client_id);
                ctx.stop();
                return;
            }

            act.alive = false;
            ctx.ping(b"");
        });
    }

    /// Hand one text frame to the dispatcher. The dispatch runs detached so
    /// an in-flight application callback survives this connection dropping;
    /// `ctx.wait` keeps handling strictly sequential per connection.
    fn dispatch(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let core = self.core.clone();
        let client_id = self.client_id;
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = core.dispatch(client_id, &text).await;
            let _ = tx.send(outcome);
        });

        ctx.wait(
            actix::fut::wrap_future::<_, Self>(async move { rx.await.ok() }).map(
                |outcome, act, ctx| {
                    if let Some(outcome) = outcome {
                        act.apply(outcome, ctx);
                    }
                },
            ),
        );
    }

    fn apply(&mut self, outcome: Outcome, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(reply) = outcome.reply {
            ctx.text(reply.to_frame());
        }
        if outcome.disposition == Disposition::Close {
            ctx.close(None);
            ctx.stop();
        }
    }
}

impl Actor for PairingSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let sink = Arc::new(ActorSink {
            addr: ctx.address(),
        });
        let session_id = self.core.accept(self.client_id, sink);

        tracing::info!(
            "client connected: {} (session {})",
            self.client_id,
            session_id
        );

        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("client disconnected: {}", self.client_id);

        // The registry checks whether the session still exists before any
        // fanout; a session already finalized is a no-op here.
        self.core.connection_closed(self.client_id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PairingSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.alive = true;
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.alive = true;
            }
            Ok(ws::Message::Text(text)) => {
                self.alive = true;
                self.dispatch(text.to_string(), ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.alive = true;
                ctx.text(BrokerReply::error("binary frames are not supported").to_frame());
                ctx.close(None);
                ctx.stop();
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!("client closing connection: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {
                self.alive = true;
            }
            Err(err) => {
                tracing::error!(
                    "websocket protocol error from {}: {}",
                    self.client_id,
                    err
                );
                ctx.stop();
            }
        }
    }
}

impl Handler<PushFrame> for PairingSession {
    type Result = ();

    fn handle(&mut self, msg: PushFrame, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}

impl Handler<CloseConnection> for PairingSession {
    type Result = ();

    fn handle(&mut self, msg: CloseConnection, ctx: &mut Self::Context) -> Self::Result {
        if let Some(frame) = msg.0 {
            ctx.text(frame);
        }
        ctx.close(None);
        ctx.stop();
    }
}
