use parallax_terminal::{
    ledger::{Ledger, LedgerKind},
    wire::{Command, Packet, PacketType},
};

#[test]
fn command_frame_is_medium_sized() {
    let pkt = Command::DeleteAll.to_packet(2001);
    assert_eq!(pkt.packet_type(), PacketType::Cmd);
    assert_eq!(pkt.len(), 262);
    assert!(pkt.crc_matches());
    assert_eq!(Command::from_packet(&pkt), Ok(Command::DeleteAll));
}

#[tokio::test]
async fn ledger_holds_a_frame_until_deleted() {
    let ledger = Ledger::new(LedgerKind::Cr, 2);
    let pkt = Packet::with_raw(PacketType::Void, 5, true, &[1, 2, 3]);

    ledger.add(pkt.as_bytes(), 5, true).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.peek(5).unwrap(), pkt.as_bytes());
    ledger.delete(5).unwrap();
    assert!(ledger.is_empty());
    assert!(ledger.delete(5).is_err());
}
