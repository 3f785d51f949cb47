//! User enrolment, removal and sync.
//!
//! A user lives in two places, the storage table and the sensor. Every
//! edit that touches both writes the slot to the journal first and clears
//! it once both sides agree again. If the device dies in between, boot
//! finds the journal and erases the slot from both sides.

use std::sync::Arc;

use super::Context;
use crate::{
    config::BrickedCode,
    fatal::{Fatal, RestartReason},
    logging::{debug, error, info, warn},
    peripherals::{Sensor, SensorStatus},
    settings::MAX_EMPLOYEE,
    wire::{AddUser, CmdResp, CmdStatus, EmployeeRecord, PacketType, SyncMode, SyncRequest},
};

/// Journal value of an interrupted DELETE_ALL.
pub const JOURNAL_ALL: u16 = 0xFFFF;

/// Sensor deletes tried before the device gives up on the slot.
const DELETE_ATTEMPTS: u32 = 3;

const SYNC_BANNER: &str = "Busy Syncing!..";

pub(super) async fn add_user(
    ctx: &Context,
    orig: u16,
    user: AddUser,
    enroll_print: bool,
) -> Result<(), Fatal> {
    let store = &ctx.periph.users;
    let slot = match store.find_uid(user.uid) {
        Some(slot) if user.replace => {
            warn!("uid {} already in slot {slot}, replacing", user.uid);
            journal(ctx, slot)?;
            let deleted = delete_slot(ctx, slot, enroll_print).await?;
            clear_journal(ctx)?;
            if !deleted {
                // nothing was touched, the old user is still in place
                return ctx.outbox.respond(orig, CmdStatus::FAILED).await;
            }
            slot
        }
        Some(slot) => {
            warn!("uid {} already in slot {slot}", user.uid);
            return ctx.outbox.respond(orig, CmdStatus::UID_EXISTS).await;
        }
        None => match store.free_slot() {
            Some(slot) => slot,
            None => {
                warn!("No free slot for uid {}", user.uid);
                return ctx.outbox.respond(orig, CmdStatus::FILE_MEM_FULL).await;
            }
        },
    };
    if slot as usize >= MAX_EMPLOYEE {
        error!("Storage handed out slot {slot}");
        return Err(Fatal::invariant("slot out of range"));
    }

    info!("Adding uid {} in slot {slot}", user.uid);
    journal(ctx, slot)?;

    if enroll_print {
        if let Err(status) = sensor_call(ctx, move |s| s.enroll(slot)).await? {
            warn!("Enrolment into slot {slot} failed: {status:?}");
            clear_journal(ctx)?;
            return ctx.outbox.respond(orig, CmdStatus(status.0)).await;
        }
    }

    let record = EmployeeRecord {
        slot,
        uid: user.uid,
        name: user.name,
    };
    if let Err(e) = store.write(&record) {
        // The journal stays set; boot erases the half-added slot.
        error!("Storing slot {slot} failed: {e:?}");
        ctx.outbox.respond(orig, CmdStatus::FAILED).await?;
        return Err(Fatal(RestartReason::StorageCommitFailed));
    }

    clear_journal(ctx)?;
    ctx.outbox.respond(orig, CmdStatus::GOOD).await
}

/// DELETE_SPECIFIC and its storage-only twin.
pub(super) async fn delete_user(
    ctx: &Context,
    orig: u16,
    slot: u16,
    remove_print: bool,
) -> Result<(), Fatal> {
    if slot as usize >= MAX_EMPLOYEE {
        error!("Asked to delete slot {slot}");
        return Err(Fatal::invariant("slot out of range"));
    }
    if ctx.periph.users.get(slot).is_none() {
        warn!("Asked to delete empty slot {slot}");
        return ctx
            .outbox
            .respond(orig, CmdStatus::FILE_USER_NOT_EXIST)
            .await;
    }

    journal(ctx, slot)?;
    let deleted = delete_slot(ctx, slot, remove_print).await?;
    clear_journal(ctx)?;

    let status = if deleted {
        CmdStatus::GOOD
    } else {
        CmdStatus::FAILED
    };
    ctx.outbox.respond(orig, status).await
}

pub(super) async fn delete_all(ctx: &Context, orig: u16) -> Result<(), Fatal> {
    info!("Deleting every user");
    journal(ctx, JOURNAL_ALL)?;
    let ok = erase_everything(ctx).await?;
    clear_journal(ctx)?;

    let status = if ok { CmdStatus::GOOD } else { CmdStatus::FAILED };
    ctx.outbox.respond(orig, status).await
}

/// One response per stored user, `sequence` carrying the slot.
pub(super) async fn send_all_users(ctx: &Context, orig: u16) -> Result<(), Fatal> {
    let users = ctx.periph.users.list();
    info!("Reporting {} users", users.len());
    if users.is_empty() {
        return ctx.outbox.respond(orig, CmdStatus::FILE_MEM_EMPTY).await;
    }

    let total = users.len() as u8;
    for user in users {
        let resp = CmdResp {
            status: CmdStatus::GOOD,
            orig_txn_id: orig,
            total_packets: total,
            sequence: user.slot as u8,
            payload_len: user.advertised_len(),
            payload: user.to_bytes(),
        };
        ctx.outbox.send_payload(PacketType::CmdResp, &resp).await?;
    }
    Ok(())
}

/// Second half of GET_ALL_USERS_AND_SYNC: drop what the server no longer
/// knows about, then let people log in again.
pub(super) async fn sync(ctx: &Context, orig: u16, req: &SyncRequest) -> Result<(), Fatal> {
    let status = if !req.crc_ok() {
        warn!("Sync bitfield fails its crc32 ({:#010x})", req.crc32);
        CmdStatus::FAILED_CRC
    } else {
        ctx.periph.display.show(SYNC_BANNER);
        let remove_print = req.mode != SyncMode::TEST;
        for slot in req.doomed_slots() {
            if slot as usize >= MAX_EMPLOYEE {
                continue;
            }
            journal(ctx, slot)?;
            if !delete_slot(ctx, slot, remove_print).await? {
                debug!("Sync could not delete slot {slot}");
            }
            clear_journal(ctx)?;
        }
        CmdStatus::GOOD
    };

    ctx.defuse_sync_timer();
    ctx.outbox.respond(orig, status).await
}

/// Finishes whatever user edit the last run left behind.
pub(super) async fn recover_journal(ctx: &Context) -> Result<(), Fatal> {
    let pending = match ctx.config.journal() {
        Ok(pending) => pending,
        Err(e) => {
            error!("Journal unreadable ({e:?}), discarding it");
            return clear_journal(ctx);
        }
    };
    match pending {
        None => return Ok(()),
        Some(JOURNAL_ALL) => {
            warn!("Interrupted delete-all, erasing every user");
            erase_everything(ctx).await?;
        }
        Some(slot) if slot as usize >= MAX_EMPLOYEE => {
            error!("Journal names slot {slot}, which cannot exist, discarding it");
        }
        Some(slot) => {
            warn!("Interrupted edit of slot {slot}, erasing it");
            if let Err(e) = ctx.periph.users.delete(slot) {
                debug!("Slot {slot} not in storage: {e:?}");
            }
            forget_print(ctx, slot).await?;
        }
    }
    // Cleared even if the erase was partial, so a bad slot cannot loop boot.
    clear_journal(ctx)
}

/// Storage first, then the sensor. `false` when storage refused, in which
/// case the sensor is left alone so the two stay in step.
async fn delete_slot(ctx: &Context, slot: u16, remove_print: bool) -> Result<bool, Fatal> {
    if let Err(e) = ctx.periph.users.delete(slot) {
        error!("Storage would not delete slot {slot}: {e:?}");
        return Ok(false);
    }
    if remove_print {
        forget_print(ctx, slot).await?;
    }
    info!("Slot {slot} deleted");
    Ok(true)
}

/// Deletes a print, resetting the sensor between tries. A sensor that keeps
/// a print it was told to forget bricks the device.
async fn forget_print(ctx: &Context, slot: u16) -> Result<(), Fatal> {
    for attempt in 1..=DELETE_ATTEMPTS {
        match sensor_call(ctx, move |s| s.delete(slot)).await? {
            Ok(()) | Err(SensorStatus::NO_USER) => return Ok(()),
            Err(status) => {
                warn!("Sensor delete of {slot} failed ({status:?}), attempt {attempt}");
                ctx.periph.sensor.reset();
            }
        }
    }

    error!("Sensor keeps slot {slot}, bricking");
    if let Err(e) = ctx.config.set_bricked(BrickedCode::FAILED_TO_DELETE_THUMB) {
        error!("Could not persist the bricked code: {e:?}");
    }
    Err(Fatal(RestartReason::FailedToDeleteThumb))
}

async fn erase_everything(ctx: &Context) -> Result<bool, Fatal> {
    let mut ok = true;
    if let Err(status) = sensor_call(ctx, |s| s.delete_all()).await? {
        warn!("Sensor delete-all failed: {status:?}");
        ok = false;
    }
    if let Err(e) = ctx.periph.users.delete_all() {
        warn!("Storage delete-all failed: {e:?}");
        ok = false;
    }
    Ok(ok)
}

/// Runs a sensor request off the async workers; the sensor answers slowly.
async fn sensor_call<T, F>(ctx: &Context, f: F) -> Result<T, Fatal>
where
    T: Send + 'static,
    F: FnOnce(&dyn Sensor) -> T + Send + 'static,
{
    let sensor: Arc<dyn Sensor> = ctx.periph.sensor.clone();
    tokio::task::spawn_blocking(move || f(sensor.as_ref()))
        .await
        .map_err(|e| {
            error!("Sensor request died: {e}");
            Fatal::invariant("sensor request panicked")
        })
}

fn journal(ctx: &Context, slot: u16) -> Result<(), Fatal> {
    ctx.config.set_journal(slot).map_err(|e| {
        error!("Could not journal slot {slot}: {e:?}");
        Fatal::invariant("journal write failed")
    })
}

fn clear_journal(ctx: &Context) -> Result<(), Fatal> {
    ctx.config.clear_journal().map_err(|e| {
        error!("Could not clear the journal: {e:?}");
        Fatal::invariant("journal write failed")
    })
}
