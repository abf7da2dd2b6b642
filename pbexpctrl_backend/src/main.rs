//! Command line front end.
//!
//! ```bash
//! # Print the Rabi program for a 40 ns microwave pulse
//! pbexpctrl_backend_bin compile --mw-ns 40
//!
//! # Rabi scan from 0 to 200 ns in 10 ns steps, three passes
//! pbexpctrl_backend_bin --config setup.toml rabi --max-ns 200 --step-ns 10 --repeats 3
//!
//! # Ten self-timed 100 ms counting windows
//! pbexpctrl_backend_bin count --window-ms 100 -n 10
//! ```
//!
//! Without the `hardware` feature every command runs against the simulated devices.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pbcompiler_backend::*;
use pbexpctrl_backend::*;

#[derive(Parser)]
#[command(name = "pbexpctrl")]
#[command(about = "PulseBlaster ODMR sequences with NI-DAQmx photon counting")]
struct Cli {
    /// Setup configuration (TOML). Lab defaults are used without it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a compiled program and its run length
    Compile {
        /// Microwave pulse width of the Rabi program
        #[arg(long, default_value_t = 0)]
        mw_ns: u64,

        /// Print the continuous green program with this period instead
        #[arg(long)]
        cw_period_ns: Option<u64>,
    },

    /// Sweep the microwave pulse width and print photons per detection window
    Rabi {
        #[arg(long, default_value_t = 0)]
        min_ns: u64,

        #[arg(long)]
        max_ns: u64,

        #[arg(long, default_value_t = 10)]
        step_ns: u64,

        /// Passes over all widths, defaults to the configured value
        #[arg(long)]
        repeats: Option<usize>,
    },

    /// Count photons in windows timed by the counter card
    Count {
        #[arg(long, default_value_t = 100.0)]
        window_ms: f64,

        /// Number of windows
        #[arg(short = 'n', long, default_value_t = 10)]
        windows: usize,
    },

    /// Print the effective configuration
    Config,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[cfg(feature = "hardware")]
fn open_sequencer(config: &ExpConfig) -> CtrlResult<PbBoard> {
    PbBoard::open(config.sequencer.board, config.sequencer.core_clock_mhz)
}

#[cfg(feature = "hardware")]
fn open_card(_config: &ExpConfig) -> NiCard {
    NiCard
}

/// Photon rate of the simulated counters.
#[cfg(not(feature = "hardware"))]
const SIM_PHOTON_RATE_HZ: f64 = 5e4;

/// Roughly one detection window per default Rabi shot.
#[cfg(not(feature = "hardware"))]
const SIM_GATE_RATE_HZ: f64 = 7.5e4;

#[cfg(not(feature = "hardware"))]
fn open_sequencer(_config: &ExpConfig) -> CtrlResult<MockSequencer> {
    tracing::warn!("Built without the hardware feature, using simulated devices");
    Ok(MockSequencer::new())
}

#[cfg(not(feature = "hardware"))]
fn open_card(config: &ExpConfig) -> MockCounterCard {
    MockCounterCard::new()
        .with_rate(&config.counter.count_chan, SIM_PHOTON_RATE_HZ)
        .with_rate(&config.counter.photon_chan, SIM_PHOTON_RATE_HZ)
        .with_rate(&config.counter.gate_chan, SIM_GATE_RATE_HZ)
}

fn compile(config: &ExpConfig, mw_ns: u64, cw_period_ns: Option<u64>) -> CtrlResult<()> {
    let channels = config.rabi_channels()?;
    let prog = match cw_period_ns {
        Some(period) => cw_program(&channels, period)?,
        None => {
            let timing = config.rabi_timing(mw_ns);
            for (name, value) in timing.summary() {
                info!("{:>6}: {} ns", name, value);
            }
            timing.compile(&channels, config.encoding())?
        }
    };
    println!("{}", prog);
    match prog.run_length_ns() {
        Some(ns) => println!("run length: {} ns ({:.6} s)", ns, ns as f64 * 1e-9),
        None => println!("run length: unbounded"),
    }
    Ok(())
}

fn rabi(
    config: &ExpConfig,
    widths: Vec<u64>,
    repeats: Option<usize>,
    interrupt: &Interrupter,
) -> CtrlResult<()> {
    let mut scan = RabiScan::new(config.rabi_timing(0), widths);
    scan.encoding = config.encoding();
    scan.channels = config.rabi_channels()?;
    scan.repeats = repeats.unwrap_or(config.rabi.repeats);
    // Fail on timing before opening any device
    scan.compile_all()?;

    let card = open_card(config);
    let mut gated =
        GatedCounter::new(&card, &config.gated_channels())?.with_timeout(config.counter_timeout()?);
    let mut session = PulseSession::new(open_sequencer(config)?);

    let series = scan.run(&mut session, &mut gated, interrupt)?;
    println!("{:>10} {:>14} {:>4}", "mw_ns", "photons/gate", "n");
    for point in series.points() {
        println!("{:>10} {:>14.4} {:>4}", point.x, point.rate, point.n);
    }
    Ok(())
}

fn count(
    config: &ExpConfig,
    window_ms: f64,
    windows: usize,
    interrupt: &Interrupter,
) -> CtrlResult<()> {
    let window = duration_from_secs("Counting window", window_ms * 1e-3)?;
    let counter = SyncCounter::with_channels(
        open_card(config),
        &config.counter.pulse_chan,
        &config.counter.count_chan,
    )?
    .with_timeout(config.counter_timeout()?);
    let mut pair = counter.pair(window)?;

    println!("{:>10} {:>14}", "t_s", "counts/s");
    for sample in pair.rates(interrupt).take(windows) {
        let (elapsed_s, rate) = sample?;
        println!("{:>10.3} {:>14.1}", elapsed_s, rate);
    }
    Ok(())
}

fn run(cli: Cli) -> CtrlResult<()> {
    let config = match &cli.config {
        Some(path) => ExpConfig::load(path)?,
        None => ExpConfig::default(),
    };
    let interrupt = Interrupter::new();
    interrupt.install_ctrlc_handler()?;

    match cli.command {
        Commands::Compile {
            mw_ns,
            cw_period_ns,
        } => compile(&config, mw_ns, cw_period_ns),
        Commands::Rabi {
            min_ns,
            max_ns,
            step_ns,
            repeats,
        } => rabi(
            &config,
            pulse_widths(min_ns, max_ns, step_ns)?,
            repeats,
            &interrupt,
        ),
        Commands::Count { window_ms, windows } => count(&config, window_ms, windows, &interrupt),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
