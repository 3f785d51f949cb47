//! Server command handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::{BusyGuard, Context, users};
use crate::{
    fatal::{Fatal, RestartReason},
    logging::{debug, error, info, warn},
    wire::{CmdResp, CmdStatus, Command, Login, Packet, PacketType},
};

/// Spacing of the VOID frames of an ack stress run.
const ACK_STRESS_GAP: Duration = Duration::from_millis(50);

const COOLDOWN_FIRST: &str = "Within Cooldown Ignored - Normal!";
const COOLDOWN_SECOND: &str = "Try Again In 2  Minutes. Thanks!";

/// Parses a CMD frame and starts its handler, unless one is still running.
pub(super) async fn dispatch(ctx: &Arc<Context>, pkt: Packet) -> Result<(), Fatal> {
    let orig = pkt.txn_id();
    let cmd = Command::from_packet(&pkt).map_err(|e| {
        error!("Command {orig} does not parse: {e:?}");
        Fatal::invariant("unknown command")
    })?;

    let Some(busy) = BusyGuard::try_acquire(ctx) else {
        warn!("Busy, rejecting command {} ({orig})", cmd.code());
        return ctx.outbox.respond(orig, CmdStatus::FAILED).await;
    };
    ctx.follow_chain(cmd.code(), cmd.chained_follower())?;

    info!("Command {} ({orig})", cmd.code());
    let task_ctx = ctx.clone();
    ctx.spawn(async move { execute(&task_ctx, cmd, orig, busy).await });
    Ok(())
}

async fn execute(
    ctx: &Arc<Context>,
    cmd: Command,
    orig: u16,
    busy: BusyGuard,
) -> Result<(), Fatal> {
    let outbox = &ctx.outbox;
    match cmd {
        Command::DeleteAll => users::delete_all(ctx, orig).await,
        Command::GetAllUsers => users::send_all_users(ctx, orig).await,
        Command::DeleteSpecific { slot } => users::delete_user(ctx, orig, slot, true).await,
        Command::Disconnect => {
            outbox.respond(orig, CmdStatus::GOOD).await?;
            drop(busy);
            info!("Disconnecting in {:?}", ctx.settings.disconnect_delay);
            sleep(ctx.settings.disconnect_delay).await;
            Err(Fatal(RestartReason::Commanded))
        }
        Command::AddUser(user) => users::add_user(ctx, orig, user, true).await,
        Command::GetAllUsersAndSync => {
            ctx.arm_sync_timer();
            users::send_all_users(ctx, orig).await
        }
        Command::Sync(req) => users::sync(ctx, orig, &req).await,
        Command::DisplayMessage { msg } => {
            debug!("Cooldown message {msg}");
            let display = &ctx.periph.display;
            sleep(ctx.settings.display_pause).await;
            display.show(COOLDOWN_FIRST);
            sleep(ctx.settings.display_pause).await;
            display.show(COOLDOWN_SECOND);
            outbox.respond(orig, CmdStatus::GOOD).await
        }

        Command::Echo => outbox.respond(orig, CmdStatus::GOOD).await,
        Command::TimeOutNextPacket => {
            ctx.transport.skip_next_device_ack();
            outbox.respond(orig, CmdStatus::GOOD).await
        }
        Command::Void => Ok(()),
        Command::SendMultiPart { count } => multi_part(ctx, orig, count, count).await,
        Command::SendMultiPartFail => multi_part(ctx, orig, 10, 5).await,
        Command::AddUserToFlash(user) => users::add_user(ctx, orig, user, false).await,
        Command::DeleteSpecificFlash { slot } => users::delete_user(ctx, orig, slot, false).await,
        Command::SendTestLogin => {
            let login = Login {
                temperature: 0,
                sign_in: true,
                uid: 0xdead_beef,
                name: "fake name".into(),
            };
            outbox.send_payload(PacketType::Login, &login).await.map(drop)
        }
        Command::SetDeviceId { id } => {
            let status = match ctx.config.set_device_id(id) {
                Ok(()) => {
                    info!("Device id is now {id}");
                    CmdStatus::GOOD
                }
                Err(e) => {
                    warn!("Could not store device id: {e:?}");
                    CmdStatus::ITEM_CANT_SET
                }
            };
            outbox.respond(orig, status).await
        }
        Command::GetDeviceId => {
            let id = ctx.config.device_id();
            let resp = CmdResp::with_body(CmdStatus::GOOD, orig, &id.to_le_bytes());
            outbox.respond_with(&resp).await
        }
        Command::AckStress => {
            drop(busy);
            ack_stress(ctx, orig).await
        }
    }
}

/// Announces `total` responses, sends `sent` of them.
async fn multi_part(ctx: &Context, orig: u16, total: u8, sent: u8) -> Result<(), Fatal> {
    info!("Sending {sent} of {total} responses");
    for i in 0..sent {
        let resp = CmdResp {
            total_packets: total,
            sequence: i,
            ..CmdResp::with_body(CmdStatus::GOOD, orig, &[i])
        };
        ctx.outbox.respond_with(&resp).await?;
    }
    Ok(())
}

async fn ack_stress(ctx: &Context, orig: u16) -> Result<(), Fatal> {
    let count = ctx.settings.ack_stress_count;
    info!("Ack stress: {count} VOID frames");
    for _ in 0..count {
        let pkt = Packet::with_raw(PacketType::Void, ctx.outbox.next_id(), true, &[]);
        ctx.outbox.send(pkt).await?;
        sleep(ACK_STRESS_GAP).await;
    }
    info!("Ack stress done");
    ctx.outbox.respond(orig, CmdStatus::GOOD).await
}
