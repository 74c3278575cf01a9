//! Chat command handlers.

use async_trait::async_trait;
use tracing::warn;

use hermod_core::{Context, Handler};
use hermod_proto::messages::{MessagePush, MessageReq, MessageResp};
use hermod_proto::{command, Flag, Packet, Status};

/// Direct message: resolve where the destination account lives and push the
/// message there, then acknowledge the sender.
pub struct TalkHandler;

#[async_trait]
impl Handler for TalkHandler {
    async fn call(&self, ctx: &mut Context) {
        let req: MessageReq = match ctx.read_body() {
            Ok(req) => req,
            Err(e) => {
                let _ = ctx.resp_with_error(Status::InvalidPacket, &e.to_string()).await;
                return;
            }
        };

        let storage = ctx.session_storage();
        let dest = match storage.get_location(&req.dest, "").await {
            Ok(Some(location)) => location,
            Ok(None) => {
                let _ = ctx
                    .resp_with_error(Status::NoDestination, &format!("{} is offline", req.dest))
                    .await;
                return;
            }
            Err(e) => {
                let _ = ctx.resp_with_error(Status::SystemException, &e.to_string()).await;
                return;
            }
        };

        let message_id = chrono::Utc::now().timestamp_millis();
        let mut push = Packet::new(command::CHAT_TALK);
        push.flag = Flag::Push;
        push.set_status(Status::Success);
        push.write_body(&MessagePush {
            message_id,
            sender: ctx.session().account.clone(),
            body: req.body,
            extra: req.extra,
        });
        if let Err(e) = ctx
            .dispatcher()
            .push(&dest.gate_id, &[dest.channel_id.clone()], push)
            .await
        {
            warn!(dest = %dest.channel_id, error = %e, "message push failed");
        }

        let _ = ctx.resp(Status::Success, &MessageResp { message_id }).await;
    }
}
