//! End-to-end bus scenarios against the simulated target.

use tachyon_scsi::command::CmdPlace;
use tachyon_scsi::{
    AbortOutcome, CmdError, Command, DataDir, DataRegion, Engine, EngineConfig, ResetScope,
    ScsiStatus, SubmitError,
};
use tachyon_scsi_sim::{Collector, SimBus, SimHandle, TargetProfile};

const READ_10: [u8; 10] = [0x28, 0, 0, 0, 0, 0, 0, 0x02, 0x00, 0];

fn setup(targets: Vec<(u8, TargetProfile)>) -> (Engine<SimHandle, Collector>, SimHandle, Collector) {
    setup_cfg(targets, EngineConfig::default())
}

fn setup_cfg(
    targets: Vec<(u8, TargetProfile)>,
    config: EngineConfig,
) -> (Engine<SimHandle, Collector>, SimHandle, Collector) {
    let mut bus = SimBus::new();
    for (id, profile) in targets {
        bus.add_target(id, profile);
    }
    let handle = SimHandle::new(bus);
    let collector = Collector::new();
    let engine = Engine::new(handle.clone(), collector.clone(), config);
    (engine, handle, collector)
}

fn read_cmd(target: u8) -> Command {
    Command::new(
        target,
        0,
        &READ_10,
        DataDir::In,
        Some(DataRegion {
            addr: 0x10_0000,
            len: 512,
        }),
    )
}

fn run(engine: &mut Engine<SimHandle, Collector>, ticks: u32) {
    for _ in 0..ticks {
        engine.tick();
        engine.poll();
    }
}

#[test]
fn plain_read_completes_after_discovery() {
    let profile = TargetProfile {
        data: vec![0xAB; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert!(completed[0].is_ok());
    assert_eq!(completed[0].residual(), 0);

    // Discovery probed before the read: start unit, inquiry, then the
    // user command.
    bus.with(|b| {
        let ops: Vec<u8> = b.cdb_log.iter().map(|c| c[0]).collect();
        assert_eq!(ops, [0x1B, 0x12, 0x28]);
    });
    assert!(engine.counters_consistent());
}

#[test]
fn disconnecting_target_completes_via_reselection() {
    let profile = TargetProfile {
        disconnect: true,
        data: vec![0x55; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, _bus, done) = setup(vec![(3, profile)]);

    engine.submit(read_cmd(3)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].is_ok());
    assert!(engine.stats().disconnects >= 1);
    assert!(engine.stats().reselections >= 1);
    assert!(engine.counters_consistent());
}

#[test]
fn stale_tag_reselection_is_aborted_without_losing_work() {
    let profile = TargetProfile {
        disconnect: true,
        data: vec![0x11; 512],
        ..TargetProfile::disk().with_tags()
    };
    let (mut engine, bus, done) = setup(vec![(1, profile)]);
    bus.with(|b| b.hold_reselect = true);

    let a = engine.submit(read_cmd(1)).unwrap();
    let b = engine.submit(read_cmd(1)).unwrap();
    run(&mut engine, 2);
    assert_eq!(done.count(), 0);
    bus.with(|s| assert_eq!(s.parked_count(), 2));

    // A reselection naming a tag we never issued gets ABORT TAG and the
    // real work stays queued.
    bus.with(|s| s.inject_reselect(1, 0, Some(7)));
    engine.poll();
    assert_eq!(done.count(), 0);
    bus.with(|s| {
        assert_eq!(s.parked_count(), 2);
        assert!(s.msgout_log.iter().any(|m| m[0] == 0x0D));
    });
    assert!(engine.counters_consistent());

    // Both genuine nexuses still resume and complete; the second rides
    // the automatic reselection after the first finishes.
    bus.with(|s| s.hold_reselect = false);
    bus.with(|s| s.inject_reselect(1, 0, Some(0)));
    run(&mut engine, 6);

    assert_eq!(done.count(), 2);
    let completed = done.completed.borrow();
    assert!(completed.iter().all(Command::is_ok));
    drop(completed);
    let _ = (a, b);
    assert!(engine.counters_consistent());
}

#[test]
fn sync_negotiation_clamps_the_answer() {
    let profile = TargetProfile {
        sdtr_answer: Some((50, 4)),
        data: vec![0; 512],
        ..TargetProfile::disk().with_sync()
    };
    let (mut engine, _bus, done) = setup(vec![(4, profile)]);

    engine.submit(read_cmd(4)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    let nego = done.negotiated.borrow();
    let (target, sync, _) = nego.last().copied().expect("negotiation reported");
    assert_eq!(target, 4);
    let sync = sync.expect("sync agreed");
    assert_eq!(sync.period, 50);
    assert_eq!(sync.offset, 4);
}

#[test]
fn rejected_sync_negotiation_falls_back_to_async() {
    let profile = TargetProfile {
        reject_sdtr: true,
        data: vec![0; 512],
        ..TargetProfile::disk().with_sync()
    };
    let (mut engine, _bus, done) = setup(vec![(4, profile)]);

    engine.submit(read_cmd(4)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].is_ok());
    let nego = done.negotiated.borrow();
    let (_, sync, _) = nego.last().copied().expect("negotiation reported");
    assert!(sync.is_none());
}

#[test]
fn target_initiated_sdtr_is_answered_within_limits() {
    let profile = TargetProfile {
        initiate_sdtr: Some((10, 32)),
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, _bus, done) = setup(vec![(5, profile)]);

    engine.submit(read_cmd(5)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    let nego = done.negotiated.borrow();
    let (_, sync, _) = nego.last().copied().expect("negotiation reported");
    let sync = sync.expect("sync agreed");
    // Offered 10/32, our limits are 25/8.
    assert_eq!(sync.period, 25);
    assert_eq!(sync.offset, 8);
}

#[test]
fn stuck_disconnected_command_times_out_through_bus_reset() {
    let profile = TargetProfile {
        disconnect: true,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);
    bus.with(|b| b.hold_reselect = true);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 2);
    assert_eq!(done.count(), 0);

    // The deadline supervisor eventually forces a bus reset and the
    // command completes with a timeout.
    run(&mut engine, 120);
    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert!(completed[0].errors().contains(CmdError::TIMEOUT));
    drop(completed);
    bus.with(|b| assert_eq!(b.resets, 1));
    assert_eq!(engine.stats().bus_resets, 1);
    assert!(engine.counters_consistent());
}

#[test]
fn queue_full_shrinks_window_and_retries_silently() {
    let profile = TargetProfile {
        status_script: vec![(0x28, 0x28)],
        data: vec![0; 512],
        ..TargetProfile::disk().with_tags()
    };
    let (mut engine, bus, done) = setup(vec![(6, profile)]);

    engine.submit(read_cmd(6)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert!(completed[0].is_ok());
    // The queue-full never surfaces on the completed command.
    assert!(completed[0].errors().is_empty());
    drop(completed);
    assert_eq!(engine.stats().retries, 1);

    // Tagged discovery ran the control mode page probe.
    bus.with(|b| {
        let ops: Vec<u8> = b.cdb_log.iter().map(|c| c[0]).collect();
        assert_eq!(&ops[..3], [0x1B, 0x12, 0x1A]);
    });
}

#[test]
fn check_condition_autosenses_and_delivers_sense() {
    let profile = TargetProfile {
        status_script: vec![(0x28, 0x02)],
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, _bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert_eq!(completed[0].status(), Some(ScsiStatus::CheckCondition));
    assert!(completed[0].errors().contains(CmdError::CHECK_CONDITION));
    let sense = completed[0].sense().expect("sense attached");
    assert_eq!(sense.bytes[0], 0x70);
    assert_eq!(sense.bytes[2] & 0x0F, 0x05);
}

#[test]
fn untagged_lun_runs_one_command_at_a_time() {
    let profile = TargetProfile {
        disconnect: true,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(3, profile)]);
    bus.with(|b| b.hold_reselect = true);

    engine.submit(read_cmd(3)).unwrap();
    engine.submit(read_cmd(3)).unwrap();
    run(&mut engine, 3);

    // Only one user command reached the bus while the first nexus is
    // disconnected.
    bus.with(|b| {
        let reads = b.cdb_log.iter().filter(|c| c[0] == 0x28).count();
        assert_eq!(reads, 1);
        assert_eq!(b.parked_count(), 1);
    });

    bus.with(|b| b.hold_reselect = false);
    bus.with(|b| b.inject_reselect(3, 0, None));
    run(&mut engine, 6);
    assert_eq!(done.count(), 2);
    assert!(done.completed.borrow().iter().all(Command::is_ok));
    assert!(engine.counters_consistent());
}

#[test]
fn selection_timeout_exhausts_retries() {
    let (mut engine, _bus, done) = setup(vec![]);

    engine.submit(read_cmd(5)).unwrap();
    run(&mut engine, 80);

    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert!(!completed[0].is_ok());
    assert!(completed[0].errors().contains(CmdError::SELECTION_TIMEOUT));
}

#[test]
fn lost_arbitration_is_retried_without_an_error() {
    let profile = TargetProfile {
        lose_selections: 2,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, _bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 20);

    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].is_ok());
    assert!(engine.stats().selections_lost >= 2);
}

#[test]
fn submit_validates_addresses_and_engine_state() {
    let (mut engine, _bus, _done) = setup(vec![]);

    // Our own id is not a target.
    assert_eq!(engine.submit(read_cmd(7)).unwrap_err(), SubmitError::BadAddress);
    assert_eq!(
        engine.submit(read_cmd(16)).unwrap_err(),
        SubmitError::BadAddress
    );

    engine.shutdown();
    assert_eq!(engine.submit(read_cmd(2)).unwrap_err(), SubmitError::Inactive);
}

#[test]
fn queued_command_aborts_immediately() {
    let profile = TargetProfile {
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, _bus, done) = setup(vec![(2, profile)]);

    engine.suspend();
    let id = engine.submit(read_cmd(2)).unwrap();
    let outcome = engine.abort(id).unwrap();
    assert_eq!(outcome, tachyon_scsi::AbortOutcome::Dequeued);
    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].errors().contains(CmdError::ABORTED));
}

#[test]
fn tag_window_admits_exactly_the_window() {
    let profile = TargetProfile {
        disconnect: true,
        data: vec![0; 512],
        ..TargetProfile::disk().with_tags()
    };
    let config = EngineConfig {
        max_tags: 2,
        ..EngineConfig::default()
    };
    let (mut engine, bus, done) = setup_cfg(vec![(2, profile)], config);
    bus.with(|b| b.hold_reselect = true);

    let ids: Vec<_> = (0..4).map(|_| engine.submit(read_cmd(2)).unwrap()).collect();
    run(&mut engine, 2);

    // Two tags outstanding; everything else waits in the start queue.
    bus.with(|b| assert_eq!(b.parked_count(), 2));
    assert_eq!(done.count(), 0);
    assert_eq!(engine.command_place(ids[2]), Some(CmdPlace::StartQueue));

    // One completion frees a tag and admits exactly one more command.
    // The reselection wins arbitration once, so allow for the backoff.
    bus.with(|b| b.inject_reselect(2, 0, Some(0)));
    run(&mut engine, 4);
    assert_eq!(done.count(), 1);
    bus.with(|b| assert_eq!(b.parked_count(), 2));
    assert_eq!(engine.command_place(ids[3]), Some(CmdPlace::StartQueue));

    bus.with(|b| b.hold_reselect = false);
    bus.with(|b| b.inject_reselect(2, 0, Some(1)));
    run(&mut engine, 20);
    assert_eq!(done.count(), 4);
    assert!(done.completed.borrow().iter().all(Command::is_ok));
    assert!(engine.counters_consistent());
}

#[test]
fn data_direction_mismatch_forces_recovery() {
    let profile = TargetProfile {
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    // A read-class CDB submitted as a write: the target presents
    // data-in against a command set up for data-out.
    let cmd = Command::new(
        2,
        0,
        &READ_10,
        DataDir::Out,
        Some(DataRegion {
            addr: 0x2000,
            len: 512,
        }),
    );
    engine.submit(cmd).unwrap();
    run(&mut engine, 2);

    // The violation completes the command and resets the bus; nothing
    // waits for the deadline supervisor.
    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert!(completed[0].errors().contains(CmdError::PROTO_FATAL));
    drop(completed);
    bus.with(|b| assert_eq!(b.resets, 1));
    assert_eq!(engine.stats().bus_resets, 1);
}

#[test]
fn active_command_deadline_resets_the_bus() {
    let profile = TargetProfile {
        stall_data: true,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    assert_eq!(done.count(), 0);

    run(&mut engine, 120);
    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert!(completed[0].errors().contains(CmdError::TIMEOUT));
    drop(completed);
    bus.with(|b| assert_eq!(b.resets, 1));
    assert_eq!(engine.stats().timeouts, 1);
}

#[test]
fn overlong_message_is_rejected_without_wedging_the_parser() {
    // A 22-byte vendor extended message cannot be buffered; it must be
    // answered with MESSAGE REJECT and later messages must still parse.
    let mut opening = vec![0x01, 20, 0x7F];
    opening.extend([0u8; 19]);
    let profile = TargetProfile {
        opening_msgin: opening,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 4);
    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].is_ok());
    bus.with(|b| assert!(b.msgout_log.iter().any(|m| m[0] == 0x07)));

    // The message machinery still works on the same target.
    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 4);
    assert_eq!(done.count(), 2);
    assert!(done.completed.borrow()[1].is_ok());
}

#[test]
fn mangled_message_out_is_replayed_verbatim() {
    let profile = TargetProfile {
        garble_msgout_once: true,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].is_ok());
    // The group reported as mangled went out again, byte for byte.
    bus.with(|b| {
        assert!(b.msgout_log.len() >= 2);
        assert_eq!(b.msgout_log[0], b.msgout_log[1]);
    });
}

#[test]
fn message_parity_asks_for_a_resend() {
    let profile = TargetProfile {
        initiate_sdtr: Some((25, 8)),
        msgin_parity_glitches: 1,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(3, profile)]);

    engine.submit(read_cmd(3)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].is_ok());
    // MESSAGE PARITY ERROR went out and the resent exchange concluded.
    bus.with(|b| assert!(b.msgout_log.iter().any(|m| m[0] == 0x09)));
    let nego = done.negotiated.borrow();
    let (_, sync, _) = nego.last().copied().expect("negotiation reported");
    let sync = sync.expect("sync agreed");
    assert_eq!((sync.period, sync.offset), (25, 8));
}

#[test]
fn data_parity_retries_the_command() {
    let profile = TargetProfile {
        data_parity_glitches: 1,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, _bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 8);

    // The second attempt is clean and the glitch never surfaces.
    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert!(completed[0].is_ok());
    assert!(completed[0].errors().is_empty());
    drop(completed);
    assert_eq!(engine.stats().retries, 1);
}

#[test]
fn terminate_ends_the_active_command_with_status() {
    let profile = TargetProfile {
        stall_data: true,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    let id = engine.submit(read_cmd(2)).unwrap();
    assert_eq!(engine.command_place(id), Some(CmdPlace::Active));
    assert_eq!(engine.terminate(id).unwrap(), AbortOutcome::MessagePending);

    bus.with(SimBus::nudge);
    engine.poll();

    assert_eq!(done.count(), 1);
    let completed = done.completed.borrow();
    assert_eq!(completed[0].status(), Some(ScsiStatus::CommandTerminated));
    assert!(completed[0].errors().contains(CmdError::ABORTED));
    drop(completed);
    bus.with(|b| assert!(b.msgout_log.iter().any(|m| m[0] == 0x11)));
}

#[test]
fn lun_queue_clear_fails_its_commands() {
    let profile = TargetProfile {
        stall_data: true,
        data: vec![0; 512],
        ..TargetProfile::disk()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    engine.submit(read_cmd(2)).unwrap();
    engine.reset(ResetScope::Lun(2, 0));

    // The queued command fails straight away; the active one after the
    // CLEAR QUEUE message goes out.
    assert_eq!(done.count(), 1);
    bus.with(SimBus::nudge);
    engine.poll();

    assert_eq!(done.count(), 2);
    let completed = done.completed.borrow();
    assert!(completed
        .iter()
        .all(|c| c.errors().contains(CmdError::ABORTED)));
    drop(completed);
    bus.with(|b| assert!(b.msgout_log.iter().any(|m| m[0] == 0x0E)));
}

#[test]
fn linked_commands_share_one_connection() {
    let profile = TargetProfile {
        status_script: vec![(0x28, 0x10)],
        data: vec![0x33; 512],
        ..TargetProfile::disk().with_linked()
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    engine.suspend();
    engine.submit(read_cmd(2)).unwrap();
    engine.submit(read_cmd(2)).unwrap();
    engine.resume();
    run(&mut engine, 4);

    assert_eq!(done.count(), 2);
    let completed = done.completed.borrow();
    assert_eq!(completed[0].status(), Some(ScsiStatus::Intermediate));
    assert!(completed[0].errors().is_empty());
    assert!(completed[1].is_ok());
    drop(completed);

    // Both CDBs rode one selection: two discovery probes plus the pair.
    bus.with(|b| {
        let reads = b.cdb_log.iter().filter(|c| c[0] == 0x28).count();
        assert_eq!(reads, 2);
    });
    assert_eq!(engine.stats().selections, 3);
}

#[test]
fn quirky_device_is_kept_async_and_untagged() {
    // A vendor/product pair from the quirk table must not negotiate
    // even when INQUIRY advertises the features.
    let profile = TargetProfile {
        data: vec![0; 512],
        ..TargetProfile::disk()
            .with_sync()
            .with_tags()
            .with_id(b"QUANTUM ", b"LPS525S         ")
    };
    let (mut engine, bus, done) = setup(vec![(2, profile)]);

    engine.submit(read_cmd(2)).unwrap();
    run(&mut engine, 4);

    assert_eq!(done.count(), 1);
    assert!(done.completed.borrow()[0].is_ok());
    bus.with(|b| {
        // No SDTR went out and the queuing probe was skipped.
        assert!(!b.msgout_log.iter().any(|m| m.first() == Some(&0x01)));
        assert!(!b.cdb_log.iter().any(|c| c[0] == 0x1A));
    });
}
