use pbcompiler_backend::*;

fn lab_channels() -> RabiChannels {
    let map = ChannelMap::from_bit_strings([
        ("green", "111000000000000000000001"),
        ("detect", "111000000000000000000010"),
        ("mw2", "111000000000000000000100"),
        ("mw1", "111000000000000000001000"),
    ])
    .unwrap();
    RabiChannels::from_map(&map, "mw1").unwrap()
}

#[test]
fn rabi_table_for_lab_timing() {
    let timing = RabiTiming {
        mw_ns: 15,
        off_ns: 3000,
        duty_ns: 5000,
        wait_ns: 0,
        ..Default::default()
    };
    let prog = timing
        .compile(&lab_channels(), MicrowaveEncoding::WithGreen)
        .unwrap();
    let table = prog.to_array();
    println!("{}", prog);

    // JSR into the loop at row 2, whose dark time is duty - mw
    assert_eq!(table[[0, 1]], OpCode::Jsr.code() as u64);
    assert_eq!(table[[0, 2]], 2);
    assert_eq!(table[[2, 1]], OpCode::Loop.code() as u64);
    assert_eq!(table[[2, 3]], 4985);
    // Idle flags are on in every row
    for row in table.rows() {
        assert_eq!(row[0] as u32 & IDLE_FLAGS, IDLE_FLAGS);
    }
    // Microwave row keeps green on
    assert_eq!(table[[4, 0]], 0b111000000000000000001001);
    assert_eq!(table[[4, 3]], 15);
}

#[test]
fn run_length_tracks_pulse_width() {
    let channels = lab_channels();
    for mw in [0u64, 20, 100, 1000] {
        let prog = RabiTiming {
            loop_num: 100,
            ..RabiTiming::with_mw_ns(mw)
        }
        .compile(&channels, MicrowaveEncoding::Bare)
        .unwrap();
        // Both delays give back the pulse width, the pulse itself takes it once
        let shot = (5000 - mw) + (3000 - mw) + mw + 400 + 5000;
        assert_eq!(prog.run_length_ns(), Some(5000 + 100 * shot + 500 + 500));
    }
}

#[test]
fn invalid_timing_is_a_value() {
    let err = RabiTiming::with_mw_ns(6000)
        .compile(&lab_channels(), MicrowaveEncoding::WithGreen)
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::NegativeDelay {
            name: "duty - mw - wait",
            minuend: 5000,
            subtrahend: 6000
        }
    );
    assert!(err.to_string().contains("negative"));
}

#[test]
fn hand_built_program_validation() {
    let green = ChannelMask::line(0);
    let mut prog = PulseProgram::new();
    let call = prog.push(PulseInstr::new(green, OpCode::Jsr, 0, 100));
    prog.push(PulseInstr::new(ChannelMask::NONE, OpCode::Stop, 0, 100));
    // Forgot to set the call target: the subroutine would start at the JSR itself
    assert!(matches!(
        prog.validate(),
        Err(CompileError::SubroutineWithoutReturn { .. })
    ));

    let sub = prog.push(PulseInstr::hold(green, 100));
    prog.push(PulseInstr::new(ChannelMask::NONE, OpCode::Rts, 0, 100));
    prog.set_target(call, sub);
    assert!(prog.validate().is_ok());
    assert_eq!(prog.run_length_ns(), Some(400));
}

#[test]
fn cw_program_runs_until_stopped() {
    let prog = cw_program(&lab_channels(), 10_000).unwrap();
    assert_eq!(prog.len(), 2);
    assert_eq!(prog[1].target(), Some(0));
    assert_eq!(prog.run_length_ns(), None);
}
