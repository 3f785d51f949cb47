//! Server commands carried in CMD frames.
//!
//! The CMD payload is `cmd_type u8 | cmd_data[255]`. Codes at or above
//! [`Command::FIRST_DIAGNOSTIC`] belong to the backend test harness and are
//! only accepted with the `test-mode` feature.

use super::{
    DecodeError, Packet, PacketType,
    payload::{AddUser, Payload, Reader, SyncRequest, Writer},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    DeleteAll,
    GetAllUsers,
    DeleteSpecific { slot: u16 },
    Disconnect,
    AddUser(AddUser),
    /// GET_ALL_USERS, then a SYNC must follow.
    GetAllUsersAndSync,
    Sync(SyncRequest),
    DisplayMessage { msg: u8 },

    Echo,
    /// Drop the device ack of the next server frame.
    TimeOutNextPacket,
    Void,
    SendMultiPart { count: u8 },
    /// Announce ten responses, send five.
    SendMultiPartFail,
    /// ADD_USER without enrolling a fingerprint.
    AddUserToFlash(AddUser),
    /// DELETE_SPECIFIC without touching the sensor.
    DeleteSpecificFlash { slot: u16 },
    SendTestLogin,
    SetDeviceId { id: u64 },
    GetDeviceId,
    AckStress,
}

impl Command {
    pub const DELETE_ALL: u8 = 1;
    pub const GET_ALL_USERS: u8 = 2;
    pub const DELETE_SPECIFIC: u8 = 3;
    pub const DISCONNECT: u8 = 4;
    pub const ADD_USER: u8 = 6;
    pub const GET_ALL_USERS_AND_SYNC: u8 = 8;
    pub const SYNC: u8 = 9;
    pub const DISPLAY_MSG: u8 = 14;

    pub const FIRST_DIAGNOSTIC: u8 = 100;
    pub const ECHO: u8 = 100;
    pub const TIME_OUT_NEXT_PACKET: u8 = 101;
    pub const VOID: u8 = 102;
    pub const SEND_MULTI_PART_RSP: u8 = 103;
    pub const SEND_MULTI_PART_RSP_FAIL: u8 = 104;
    pub const ADD_USER_TO_FLASH: u8 = 105;
    pub const DELETE_SPECIFIC_FLASH: u8 = 106;
    pub const SEND_TEST_LOGIN: u8 = 107;
    pub const SET_DEVICE_ID: u8 = 108;
    pub const GET_DEVICE_ID: u8 = 109;
    pub const ACK_STRESS: u8 = 110;

    pub fn code(&self) -> u8 {
        match self {
            Command::DeleteAll => Self::DELETE_ALL,
            Command::GetAllUsers => Self::GET_ALL_USERS,
            Command::DeleteSpecific { .. } => Self::DELETE_SPECIFIC,
            Command::Disconnect => Self::DISCONNECT,
            Command::AddUser(_) => Self::ADD_USER,
            Command::GetAllUsersAndSync => Self::GET_ALL_USERS_AND_SYNC,
            Command::Sync(_) => Self::SYNC,
            Command::DisplayMessage { .. } => Self::DISPLAY_MSG,
            Command::Echo => Self::ECHO,
            Command::TimeOutNextPacket => Self::TIME_OUT_NEXT_PACKET,
            Command::Void => Self::VOID,
            Command::SendMultiPart { .. } => Self::SEND_MULTI_PART_RSP,
            Command::SendMultiPartFail => Self::SEND_MULTI_PART_RSP_FAIL,
            Command::AddUserToFlash(_) => Self::ADD_USER_TO_FLASH,
            Command::DeleteSpecificFlash { .. } => Self::DELETE_SPECIFIC_FLASH,
            Command::SendTestLogin => Self::SEND_TEST_LOGIN,
            Command::SetDeviceId { .. } => Self::SET_DEVICE_ID,
            Command::GetDeviceId => Self::GET_DEVICE_ID,
            Command::AckStress => Self::ACK_STRESS,
        }
    }

    /// The command that must come next, if this one opens a chain.
    pub fn chained_follower(&self) -> Option<u8> {
        match self {
            Command::GetAllUsersAndSync => Some(Self::SYNC),
            _ => None,
        }
    }

    pub fn is_diagnostic(&self) -> bool {
        self.code() >= Self::FIRST_DIAGNOSTIC
    }

    /// Parses a CMD frame.
    pub fn from_packet(pkt: &Packet) -> Result<Self, DecodeError> {
        pkt.decode(PacketType::Cmd)
    }

    /// A CMD frame for this command, as the backend would send it.
    pub fn to_packet(&self, txn_id: u16) -> Packet {
        Packet::with_payload(PacketType::Cmd, txn_id, true, self)
    }
}

impl Payload for Command {
    fn encode(&self, out: &mut [u8]) {
        Writer::new(out).u8(self.code());
        let Some(data) = out.get_mut(1..) else {
            return;
        };
        match self {
            Command::DeleteSpecific { slot } | Command::DeleteSpecificFlash { slot } => {
                Writer::new(data).u16(*slot);
            }
            Command::AddUser(user) | Command::AddUserToFlash(user) => user.encode(data),
            Command::Sync(req) => req.encode(data),
            Command::DisplayMessage { msg } => {
                Writer::new(data).u8(*msg);
            }
            Command::SendMultiPart { count } => {
                Writer::new(data).u8(*count);
            }
            Command::SetDeviceId { id } => {
                Writer::new(data).u64(*id);
            }
            _ => {}
        }
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let code = r.u8()?;
        let data = buf.get(1..).unwrap_or(&[]);
        if code >= Self::FIRST_DIAGNOSTIC && !cfg!(feature = "test-mode") {
            return Err(DecodeError::UnknownCommand(code));
        }

        Ok(match code {
            Self::DELETE_ALL => Command::DeleteAll,
            Self::GET_ALL_USERS => Command::GetAllUsers,
            Self::DELETE_SPECIFIC => Command::DeleteSpecific { slot: r.u16()? },
            Self::DISCONNECT => Command::Disconnect,
            Self::ADD_USER => Command::AddUser(AddUser::decode(data)?),
            Self::GET_ALL_USERS_AND_SYNC => Command::GetAllUsersAndSync,
            Self::SYNC => Command::Sync(SyncRequest::decode(data)?),
            Self::DISPLAY_MSG => Command::DisplayMessage { msg: r.u8()? },
            Self::ECHO => Command::Echo,
            Self::TIME_OUT_NEXT_PACKET => Command::TimeOutNextPacket,
            Self::VOID => Command::Void,
            Self::SEND_MULTI_PART_RSP => Command::SendMultiPart { count: r.u8()? },
            Self::SEND_MULTI_PART_RSP_FAIL => Command::SendMultiPartFail,
            Self::ADD_USER_TO_FLASH => Command::AddUserToFlash(AddUser::decode(data)?),
            Self::DELETE_SPECIFIC_FLASH => Command::DeleteSpecificFlash { slot: r.u16()? },
            Self::SEND_TEST_LOGIN => Command::SendTestLogin,
            Self::SET_DEVICE_ID => Command::SetDeviceId { id: r.u64()? },
            Self::GET_DEVICE_ID => Command::GetDeviceId,
            Self::ACK_STRESS => Command::AckStress,
            other => return Err(DecodeError::UnknownCommand(other)),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::SyncMode;

    #[test]
    fn delete_specific_layout() {
        let pkt = Command::DeleteSpecific { slot: 0x0102 }.to_packet(44);
        assert_eq!(pkt.packet_type(), PacketType::Cmd);
        assert_eq!(pkt.txn_id(), 44);
        assert_eq!(&pkt.payload()[..3], &[3, 0x02, 0x01]);
        assert_eq!(
            Command::from_packet(&pkt),
            Ok(Command::DeleteSpecific { slot: 0x0102 })
        );
    }

    #[test]
    fn add_user_and_sync_survive_the_wire() {
        let cmds = [
            Command::AddUser(AddUser {
                uid: 77,
                replace: true,
                name: "Grace".into(),
            }),
            Command::Sync(SyncRequest::new(SyncMode::TEST, vec![SyncRequest::EXISTS; 128])),
            Command::GetAllUsersAndSync,
            Command::DisplayMessage { msg: 1 },
        ];
        for cmd in cmds {
            assert_eq!(Command::from_packet(&cmd.to_packet(1)), Ok(cmd));
        }
    }

    #[test]
    fn unknown_codes_are_rejected() {
        let pkt = Packet::with_raw(PacketType::Cmd, 1, true, &[5]);
        assert_eq!(Command::from_packet(&pkt), Err(DecodeError::UnknownCommand(5)));
        let pkt = Packet::with_raw(PacketType::Cmd, 1, true, &[200]);
        assert_eq!(Command::from_packet(&pkt), Err(DecodeError::UnknownCommand(200)));
    }

    #[cfg(not(feature = "test-mode"))]
    #[test]
    fn diagnostics_need_test_mode() {
        let pkt = Command::Echo.to_packet(1);
        assert_eq!(Command::from_packet(&pkt), Err(DecodeError::UnknownCommand(100)));
    }

    #[cfg(feature = "test-mode")]
    #[test]
    fn diagnostics_in_test_mode() {
        let pkt = Command::SetDeviceId { id: 0xAB }.to_packet(1);
        assert_eq!(Command::from_packet(&pkt), Ok(Command::SetDeviceId { id: 0xAB }));
        assert!(Command::AckStress.is_diagnostic());
    }

    #[test]
    fn only_sync_follows_a_chain() {
        assert_eq!(Command::GetAllUsersAndSync.chained_follower(), Some(Command::SYNC));
        assert_eq!(Command::GetAllUsers.chained_follower(), None);
    }
}
