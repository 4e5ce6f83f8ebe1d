use rmemsim::memory::le_to_u64;
use rmemsim::op::{CompletionHandle, RmtOp, Target};
use rmemsim::packet::AmoOp;
use rmemsim::system::System;
use rmemsim::{PeId, RmtMemCtrl, SimConfig};
use simple_logger::SimpleLogger;

const MAX_CYCLES: u64 = 100_000;

/// Namespace naming PE `pe` (namespace 0 is always the local PE).
fn ns(pe: PeId) -> u64 {
    pe as u64 + 1
}

fn check(ok: &mut bool, what: &str, got: u64, expected: u64) {
    if got != expected {
        println!("MISMATCH {}: got {:#x}, expected {:#x}", what, got, expected);
        *ok = false;
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => SimConfig::from_json_file(path)?,
        None => SimConfig::default(),
    };
    SimpleLogger::new().with_level(config.rmc.log_level()).init()?;

    let mut sys = System::new(config)?;
    let n = sys.num_pes() as PeId;
    println!(
        "Initialized {} PEs, fabric depth {} x {} packets/cycle, memory latency {} cycles",
        n, sys.config.fabric.queue_depth, sys.config.fabric.packets_per_cycle, sys.config.mem_latency,
    );
    let mut all_correct = true;

    // --- Put / get ---
    // Every PE stores 100 + id into its right neighbour, then reads it back.
    const PUT_ADDR: u64 = 0x2000;
    for pe in 0..n {
        let right = (pe + 1) % n;
        let value = (100 + pe as u64).to_le_bytes().to_vec();
        sys.submit(pe, RmtOp::write(ns(right), PUT_ADDR, value, CompletionHandle::new(0, 1)))?;
        sys.submit(pe, RmtOp::fence(CompletionHandle::new(0, 2)))?;
        sys.submit(pe, RmtOp::read(ns(right), PUT_ADDR, 8, Target::Reg(10), CompletionHandle::new(0, 3)))?;
    }
    let cycles = sys.run_until_drained(MAX_CYCLES)?;
    for pe in 0..n {
        let done = sys.drain_completions(pe)?;
        match done.iter().find(|c| c.handle.tag == 3) {
            Some(c) => check(&mut all_correct, &format!("get on PE {}", pe), c.value(), 100 + pe as u64),
            None => {
                println!("MISSING get completion on PE {}", pe);
                all_correct = false;
            }
        }
    }
    println!("put/get:  {} cycles", cycles);

    // --- Bulk put / bulk get ---
    // PE 0 scatters 16 words into PE 1; PE n-1 then gathers them back.
    const SRC: u64 = 0x3000;
    const REMOTE: u64 = 0x4000;
    const DST: u64 = 0x5000;
    const WORDS: u32 = 16;
    {
        let mut mem = sys.pe(0)?.mem.borrow_mut();
        for i in 0..WORDS as u64 {
            mem.store_bytes(SRC + i * 4, &(0xa000 + i as u32).to_le_bytes());
        }
    }
    sys.submit(0, RmtOp::bulk_write(ns(1), REMOTE, SRC, 4, WORDS, 4, CompletionHandle::new(0, 10)))?;
    let cycles = sys.run_until_drained(MAX_CYCLES)?;
    let last = n - 1;
    sys.submit(last, RmtOp::bulk_read(ns(1), REMOTE, DST, 4, WORDS, 4, CompletionHandle::new(0, 11)))?;
    let cycles = cycles + sys.run_until_drained(MAX_CYCLES)?;
    {
        let mem = sys.pe(last)?.mem.borrow();
        for i in 0..WORDS as u64 {
            let got = le_to_u64(&mem.load_bytes(DST + i * 4, 4));
            check(&mut all_correct, &format!("bulk word {}", i), got, 0xa000 + i);
        }
    }
    let flagged = sys.pe(last)?.mem.borrow_mut().take_bulk_transfer_complete();
    if !flagged {
        println!("MISSING bulk-transfer-complete flag on PE {}", last);
        all_correct = false;
    }
    println!("bulk:     {} cycles", cycles);

    // --- Remote atomics ---
    // Every PE adds (id + 1) to a counter on PE 0.
    const COUNTER: u64 = 0x6000;
    for pe in 0..n {
        let operand = (pe as u64 + 1).to_le_bytes().to_vec();
        sys.submit(pe, RmtOp::amo(ns(0), COUNTER, AmoOp::Add, operand, Target::Reg(5), CompletionHandle::new(0, 20)))?;
    }
    let cycles = sys.run_until_drained(MAX_CYCLES)?;
    let counter = sys.pe(0)?.mem.borrow().load_u64(COUNTER);
    check(&mut all_correct, "AMO counter", counter, (n as u64) * (n as u64 + 1) / 2);
    println!("amo:      {} cycles", cycles);

    // --- LR/SC lock handshake ---
    // PE 1 reserves and takes the lock on PE 0; PE n-1 holds no reservation
    // and must fail.
    const LOCK: u64 = 0x7000;
    if n > 1 {
        sys.submit(1, RmtOp::read_lock(ns(0), LOCK, 8, Target::Reg(6), CompletionHandle::new(0, 30)))?;
        sys.submit(1, RmtOp::fence(CompletionHandle::new(0, 31)))?;
        sys.submit(1, RmtOp::write_unlock(ns(0), LOCK, 1u64.to_le_bytes().to_vec(), Target::Reg(7), CompletionHandle::new(0, 32)))?;
        sys.run_until_drained(MAX_CYCLES)?;
        sys.submit(last, RmtOp::write_unlock(ns(0), LOCK, 2u64.to_le_bytes().to_vec(), Target::Reg(7), CompletionHandle::new(0, 33)))?;
        let cycles = sys.run_until_drained(MAX_CYCLES)?;

        let owner = sys.drain_completions(1)?;
        let won = owner.iter().find(|c| c.handle.tag == 32).is_some_and(|c| c.store_succeeded());
        let lost = sys.drain_completions(last)?;
        let refused = lost.iter().find(|c| c.handle.tag == 33).is_some_and(|c| !c.store_succeeded());
        if !won || !refused {
            println!("MISMATCH lock handshake: owner won={}, intruder refused={}", won, refused);
            all_correct = false;
        }
        check(&mut all_correct, "lock word", sys.pe(0)?.mem.borrow().load_u64(LOCK), 1);
        println!("lr/sc:    {} cycles", cycles);
    }

    if all_correct {
        println!("Verification PASSED after {} cycles", sys.cycle);
    }

    for pe in &sys.pes {
        let s = pe.rmc.stats();
        println!(
            "PE {}: admitted r={} w={} lr={} sc={} | amo={} fences={} | {}B read {}B written | pkts tx={} rx={} | parked={} stalls={}",
            pe.id,
            s.admitted.read,
            s.admitted.write,
            s.admitted.read_lock,
            s.admitted.write_unlock,
            s.amos,
            s.fences_retired,
            s.read_bytes,
            s.write_bytes,
            s.packets_sent,
            s.packets_received,
            s.responses_parked,
            s.send_stalls,
        );
    }
    sys.publish_metrics("drained");

    if !all_correct {
        std::process::exit(1);
    }
    Ok(())
}
