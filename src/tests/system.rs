//! Whole-system runs over the in-process fabric.

use super::*;
use crate::system::System;

fn small_system(num_pes: usize, fabric: FabricConfig) -> System {
    let config = SimConfig {
        num_pes,
        mem_size_bytes: 1 << 20,
        mem_latency: 1,
        fabric,
        ..SimConfig::default()
    };
    System::new(config).unwrap()
}

#[test]
fn all_to_all_put_then_get() {
    let mut sys = small_system(3, FabricConfig::narrow());
    let n = sys.num_pes() as PeId;

    for pe in 0..n {
        for peer in 0..n {
            let value = (pe as u64) << 8 | peer as u64;
            let addr = 0x100 + pe as u64 * 8;
            sys.submit(pe, RmtOp::write(peer as u64 + 1, addr, value.to_le_bytes().to_vec(), handle(0)))
                .unwrap();
        }
        sys.submit(pe, RmtOp::fence(handle(1))).unwrap();
        for peer in 0..n {
            let addr = 0x100 + pe as u64 * 8;
            let op = RmtOp::read(peer as u64 + 1, addr, 8, Target::Reg(1), handle(100 + peer as u64));
            sys.submit(pe, op).unwrap();
        }
    }
    sys.run_until_drained(10_000).unwrap();

    for pe in 0..n {
        let reads: Vec<Completion> = sys
            .drain_completions(pe)
            .unwrap()
            .into_iter()
            .filter(|c| c.kind == OpKind::Read)
            .collect();
        assert_eq!(reads.len(), n as usize);
        for c in reads {
            let peer = c.handle.tag - 100;
            assert_eq!(c.value(), (pe as u64) << 8 | peer, "PE {} reading PE {}", pe, peer);
        }
    }
    assert!(sys.is_quiescent());
    assert!(sys.fabric.borrow().stats.refused > 0, "narrow fabric never pushed back");
}

#[test]
fn remote_atomics_from_every_pe() {
    let mut sys = small_system(4, FabricConfig::default());
    for pe in 0..4 {
        let op = RmtOp::amo(1, 0x40, AmoOp::Add, 3u32.to_le_bytes().to_vec(), Target::Reg(2), handle(0));
        assert!(sys.submit(pe, op).unwrap());
    }
    sys.run_until_drained(1_000).unwrap();

    assert_eq!(sys.pe(0).unwrap().mem.borrow().load_bytes(0x40, 4), 12u32.to_le_bytes().to_vec());
    let mut olds: Vec<u64> = (0..4)
        .flat_map(|pe| sys.drain_completions(pe).unwrap())
        .map(|c| c.value())
        .collect();
    olds.sort();
    assert_eq!(olds, vec![0, 3, 6, 9]);
}

#[test]
fn bulk_copy_between_peers() {
    let mut sys = small_system(3, FabricConfig::default());
    {
        let mut mem = sys.pe(0).unwrap().mem.borrow_mut();
        for i in 0..32u64 {
            mem.store_u64(0x1000 + i * 16, i * i);
        }
    }
    sys.submit(0, RmtOp::bulk_write(3, 0x8000, 0x1000, 8, 32, 16, handle(1))).unwrap();
    sys.run_until_drained(1_000).unwrap();
    sys.submit(1, RmtOp::bulk_read(3, 0x8000, 0x200, 8, 32, 16, handle(2))).unwrap();
    sys.run_until_drained(1_000).unwrap();

    let mem = sys.pe(1).unwrap().mem.borrow();
    for i in 0..32u64 {
        assert_eq!(mem.load_u64(0x200 + i * 16), i * i);
    }
}

#[test]
fn unresolvable_namespace_stops_the_run() {
    let mut sys = small_system(2, FabricConfig::default());
    sys.submit(0, RmtOp::read(9, 0, 8, Target::Reg(1), handle(0))).unwrap();
    assert!(matches!(sys.run_until_drained(100), Err(RmcError::UnknownNamespace(9))));
}

#[test]
fn busy_system_reports_timeout() {
    let mut sys = small_system(2, FabricConfig::default());
    sys.submit(0, RmtOp::write(2, 0, vec![1; 8], handle(0))).unwrap();
    assert!(matches!(sys.run_until_drained(1), Err(RmcError::NotQuiescent { cycles: 1 })));
    sys.run_until_drained(100).unwrap();
}

#[test]
fn snapshot_reflects_controllers() {
    let mut sys = small_system(2, FabricConfig::default());
    sys.submit(1, RmtOp::write(1, 0, vec![1; 4], handle(0))).unwrap();
    let before = sys.snapshot("running");
    assert_eq!(before.pes.len(), 2);
    assert_eq!(before.pes[1].outstanding, 1);
    assert!(!before.pes[1].drained);

    sys.run_until_drained(100).unwrap();
    let after = sys.snapshot("drained");
    assert_eq!(after.total_outstanding(), 0);
    assert_eq!(after.pes[1].stats.admitted.write, 1);
    assert_eq!(after.fabric.packets_delivered, 2);
}
