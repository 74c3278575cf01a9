//! Login command handlers.
//!
//! An account may hold one live session per device; signing in from a new
//! channel evicts the previous one with a kick-out notification before the
//! new session is stored.

use async_trait::async_trait;
use tracing::{info, warn};

use hermod_core::{Context, Handler};
use hermod_proto::messages::{KickoutNotify, LoginReq, LoginResp};
use hermod_proto::{command, Flag, Packet, Status};

pub struct SignInHandler;

#[async_trait]
impl Handler for SignInHandler {
    async fn call(&self, ctx: &mut Context) {
        let req: LoginReq = match ctx.read_body() {
            Ok(req) => req,
            Err(e) => {
                let _ = ctx.resp_with_error(Status::InvalidPacket, &e.to_string()).await;
                return;
            }
        };

        let session = ctx.session().clone();
        let storage = ctx.session_storage();

        // A previous login for this account gets kicked before the new
        // session lands.
        match storage.get_location(&req.account, &req.device).await {
            Ok(Some(old)) if old.channel_id != session.channel_id => {
                info!(account = %req.account, old_channel = %old.channel_id, "kick out previous login");
                let mut kick = Packet::new(command::LOGIN_KICK_OUT);
                kick.flag = Flag::Push;
                kick.set_status(Status::Success);
                kick.write_body(&KickoutNotify { channel_id: old.channel_id.clone() });
                if let Err(e) = ctx
                    .dispatcher()
                    .push(&old.gate_id, &[old.channel_id.clone()], kick)
                    .await
                {
                    warn!(error = %e, "kickout push failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "location lookup failed"),
        }

        if let Err(e) = storage.add(&session).await {
            warn!(error = %e, "session store failed");
            let _ = ctx.resp_with_error(Status::SystemException, &e.to_string()).await;
            return;
        }

        info!(account = %req.account, channel = %session.channel_id, "login");
        let _ = ctx
            .resp(
                Status::Success,
                &LoginResp {
                    channel_id: session.channel_id.clone(),
                    account: req.account,
                },
            )
            .await;
    }
}

pub struct SignOutHandler;

#[async_trait]
impl Handler for SignOutHandler {
    async fn call(&self, ctx: &mut Context) {
        let session = ctx.session().clone();
        let storage = ctx.session_storage();

        if let Err(e) = storage.delete(&session.account, &session.channel_id).await {
            warn!(error = %e, "session delete failed");
        }
        info!(account = %session.account, channel = %session.channel_id, "logout");
        // Sign-out is fired by the gateway when the channel is already
        // gone; there is nobody to answer.
    }
}
