//! Load-reserve and store-conditional issued by this PE.

use super::*;

#[test]
fn read_lock_returns_loaded_value() {
    let (mut rmc, wire) = controller(RmcConfig::default());
    rmc.submit(RmtOp::read_lock(PE1, 0x80, 8, Target::Reg(5), handle(1)));
    rmc.clock_tick().unwrap();

    let (dest, pkt) = take_sent(&wire).pop().unwrap();
    assert_eq!(dest, 1);
    assert_eq!(pkt.kind, OpKind::ReadLock);
    assert_eq!((pkt.src_addr, pkt.size, pkt.nelem), (0x80, 8, 1));
    assert!(pkt.payload.is_empty());
    assert_eq!(rmc.stats().in_flight.read_lock, 1);

    rmc.handle_packet(reply(&pkt, 41u64.to_le_bytes().to_vec())).unwrap();
    let done = rmc.poll_completion().unwrap();
    assert_eq!(done.kind, OpKind::ReadLock);
    assert_eq!(done.target, Some(Target::Reg(5)));
    assert_eq!(done.value(), 41);
    assert_eq!(rmc.stats().in_flight.read_lock, 0);
    assert_eq!(rmc.stats().read_bytes, 8);
    assert!(rmc.is_drained());
}

#[test]
fn overlapping_store_conditionals_keep_their_outcomes() {
    let (mut rmc, wire) = controller(RmcConfig::default().with_max_ops(1));
    let first = RmtOp::write_unlock(PE1, 0x80, 1u64.to_le_bytes().to_vec(), Target::Reg(6), handle(1));
    let second = RmtOp::write_unlock(PE1, 0x80, 2u64.to_le_bytes().to_vec(), Target::Reg(7), handle(2));
    assert!(rmc.submit(first));
    assert!(rmc.submit(second));

    // One admission per cycle: the second leaves before the first is answered.
    rmc.clock_tick().unwrap();
    rmc.clock_tick().unwrap();
    let sent = take_sent(&wire);
    assert_eq!(sent.len(), 2);
    let (a, b) = (&sent[0].1, &sent[1].1);
    assert!(a.kind == OpKind::WriteUnlock && b.kind == OpKind::WriteUnlock);
    assert_ne!(a.id, b.id);
    assert_eq!(a.payload, 1u64.to_le_bytes().to_vec());
    assert_eq!(rmc.stats().in_flight.write_unlock, 2);

    // Answers come back in reverse: the later store lost, the earlier landed.
    rmc.handle_packet(reply(b, vec![1])).unwrap();
    rmc.handle_packet(reply(a, vec![0])).unwrap();

    let done = completions(&mut rmc);
    assert_eq!(done.len(), 2);
    assert_eq!((done[0].handle.tag, done[0].target), (2, Some(Target::Reg(7))));
    assert_eq!(done[0].kind, OpKind::WriteUnlock);
    assert_eq!(done[0].data, vec![1]);
    assert!(!done[0].store_succeeded());
    assert_eq!((done[1].handle.tag, done[1].target), (1, Some(Target::Reg(6))));
    assert_eq!(done[1].data, vec![0]);
    assert!(done[1].store_succeeded());
    assert_eq!(rmc.stats().in_flight.write_unlock, 0);
    assert_eq!(rmc.stats().write_bytes, 16);
}
