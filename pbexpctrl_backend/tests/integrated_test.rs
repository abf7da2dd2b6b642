use std::io::Write;
use std::thread;
use std::time::Duration;

use pbcompiler_backend::*;
use pbexpctrl_backend::device::stop_quietly;
use pbexpctrl_backend::*;

fn short_timing() -> RabiTiming {
    RabiTiming {
        loop_num: 10,
        ..Default::default()
    }
}

#[test]
fn config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        [sequencer]
        board = 0

        [counter]
        gate_terminal = "PFI12"
        timeout_s = 2.5

        [rabi]
        loop_num = 200
        repeats = 4
        "#
    )
    .unwrap();

    let config = ExpConfig::load(file.path()).unwrap();
    assert_eq!(config.sequencer.board, Some(0));
    assert_eq!(config.gated_channels().gate_terminal, "PFI12");
    assert_eq!(config.counter_timeout().unwrap(), Duration::from_millis(2500));
    assert_eq!(config.rabi_timing(30).loop_num, 200);
    assert_eq!(config.rabi.repeats, 4);

    assert!(ExpConfig::load(file.path().with_extension("missing")).is_err());
}

#[test]
fn rabi_scan_with_simulated_devices() {
    let card = MockCounterCard::new()
        .with_fixed_count("Dev1/ctr0", 300)
        .with_fixed_count("Dev1/ctr3", 10);
    let seq = MockSequencer::new().with_time_scale(0.01);
    let mut session = PulseSession::new(seq.clone());
    let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
    assert_eq!(card.events(), vec!["create Dev1/ctr0", "create Dev1/ctr3"]);
    card.clear_events();

    let mut scan = RabiScan::new(short_timing(), vec![0, 10, 20]);
    scan.repeats = 2;
    let series = scan
        .run(&mut session, &mut gated, &Interrupter::new())
        .unwrap();

    assert_eq!(series.xs(), vec![0.0, 10.0, 20.0]);
    assert_eq!(series.rates(), vec![30.0; 3]);
    assert!(series.points().iter().all(|p| p.n == 2));
    assert_eq!(seq.uploads(), 6);
    assert!(!seq.is_running());

    // Gate counter starts first; photons are read first and stopped first
    assert_eq!(
        card.events()[..6].to_vec(),
        vec![
            "start Dev1/ctr3",
            "start Dev1/ctr0",
            "read Dev1/ctr0",
            "read Dev1/ctr3",
            "stop Dev1/ctr0",
            "stop Dev1/ctr3"
        ]
    );
    // The last width is what stays on the sequencer
    let last = seq.loaded().unwrap();
    assert_eq!(last[4].duration_ns, 20);
}

#[test]
fn invalid_width_uploads_nothing() {
    let card = MockCounterCard::new();
    let seq = MockSequencer::new();
    let mut session = PulseSession::new(seq.clone());
    let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
    card.clear_events();

    let scan = RabiScan::new(short_timing(), vec![10, 4000, 6000]);
    let err = scan
        .run(&mut session, &mut gated, &Interrupter::new())
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(seq.uploads(), 0);
    assert!(card.events().is_empty());
}

#[test]
fn self_timed_rate_within_one_count() {
    let card = MockCounterCard::new().with_rate("Dev1/ctr0", 1e5);
    let counter = SyncCounter::new(card.clone());
    let window = Duration::from_millis(10);
    let rate = counter.measure(window, &Interrupter::new()).unwrap();
    assert!((rate - 1e5).abs() <= 1.0 / window.as_secs_f64());

    assert_eq!(
        card.events(),
        vec![
            "create Dev1/ctr1",
            "create Dev1/ctr0",
            "start Dev1/ctr0",
            "start Dev1/ctr1",
            "read Dev1/ctr0",
            "stop Dev1/ctr0",
            "stop Dev1/ctr1"
        ]
    );
}

#[test]
fn interrupt_mid_window_stops_both_counters() {
    let card = MockCounterCard::new().with_hanging_pulse();
    let counter = SyncCounter::new(card.clone()).with_timeout(Duration::from_secs(30));
    let mut pair = counter.pair(Duration::from_millis(1)).unwrap();

    let interrupt = Interrupter::new();
    let remote = interrupt.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.interrupt();
    });
    let err = pair.count(&interrupt).unwrap_err();
    handle.join().unwrap();

    assert!(matches!(err, CtrlError::Interrupted));
    let events = card.events();
    assert_eq!(
        events[events.len() - 2..].to_vec(),
        vec!["stop Dev1/ctr0", "stop Dev1/ctr1"]
    );
    assert!(!events.iter().any(|e| e.starts_with("read")));
}

#[test]
fn hung_pulse_times_out() {
    let card = MockCounterCard::new().with_hanging_pulse();
    let counter = SyncCounter::new(card.clone()).with_timeout(Duration::from_millis(20));
    let err = counter
        .measure(Duration::from_millis(1), &Interrupter::new())
        .unwrap_err();
    assert!(err.is_hardware_fault());
    assert!(card.events().ends_with(&[
        "stop Dev1/ctr0".to_string(),
        "stop Dev1/ctr1".to_string()
    ]));
}

#[test]
fn failed_pulse_start_stops_the_counter() {
    let card = MockCounterCard::new().with_failing_start("Dev1/ctr1");
    let counter = SyncCounter::new(card.clone());
    assert!(counter
        .measure(Duration::from_millis(1), &Interrupter::new())
        .is_err());
    assert_eq!(card.events().last().unwrap(), "stop Dev1/ctr0");
}

#[test]
fn double_stop_is_tolerated() {
    let card = MockCounterCard::new();
    let mut task = card.edge_counter("Dev1/ctr0", None).unwrap();
    task.start().unwrap();
    task.stop().unwrap();
    stop_quietly(&mut task);

    let mut session = PulseSession::new(MockSequencer::new());
    session.stop().unwrap();
    session.stop().unwrap();
}

#[test]
fn gated_sample_without_gates_reads_zero() {
    let card = MockCounterCard::new()
        .with_fixed_count("Dev1/ctr0", 50)
        .with_fixed_count("Dev1/ctr3", 0);
    let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();
    let counts = gated
        .sample(Duration::from_millis(1), &Interrupter::new())
        .unwrap();
    assert_eq!(counts.photons, 50);
    assert_eq!(counts.rate(), 0.0);
}

#[test]
fn interrupted_cw_program_is_stopped() {
    let seq = MockSequencer::new();
    let mut session = PulseSession::new(seq.clone());
    let prog = cw_program(&RabiChannels::default(), 1000).unwrap();
    session.run(&prog).unwrap();
    assert!(seq.is_running());

    let interrupt = Interrupter::new();
    let remote = interrupt.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        remote.interrupt();
    });
    let err = session
        .wait_until_stopped(Duration::from_secs(30), &interrupt)
        .unwrap_err();
    handle.join().unwrap();

    assert!(matches!(err, CtrlError::Interrupted));
    assert!(!seq.is_running());
    assert_eq!(seq.events().last().unwrap(), "stop");
}

#[cfg(unix)]
#[test]
fn ctrlc_during_rabi_scan_stops_the_devices() {
    let card = MockCounterCard::new()
        .with_fixed_count("Dev1/ctr0", 300)
        .with_fixed_count("Dev1/ctr3", 10);
    let seq = MockSequencer::new();
    let mut session = PulseSession::new(seq.clone());
    let mut gated = GatedCounter::new(&card, &GatedChannels::default()).unwrap();

    let interrupt = Interrupter::new();
    interrupt.install_ctrlc_handler().unwrap();
    // A million shots take seconds per width
    let scan = RabiScan::new(RabiTiming::default(), vec![0, 10]);
    let handle = thread::spawn(|| {
        thread::sleep(Duration::from_millis(50));
        unsafe { libc::raise(libc::SIGINT) };
    });
    let err = scan.run(&mut session, &mut gated, &interrupt).unwrap_err();
    handle.join().unwrap();

    assert!(matches!(err, CtrlError::Interrupted));
    assert!(interrupt.is_interrupted());
    assert!(!seq.is_running());
    assert_eq!(seq.uploads(), 1);
    assert_eq!(seq.events().last().unwrap(), "stop");
    assert!(card.events().ends_with(&[
        "stop Dev1/ctr0".to_string(),
        "stop Dev1/ctr3".to_string()
    ]));
}
