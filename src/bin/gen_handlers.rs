use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use handlergen::arch::riscv::RiscvArchitecture;
use handlergen::config::GeneratorConfig;
use handlergen::handlers::HandlerMode;
use handlergen::model::SimSequence;
use handlergen::sequence::Sequence;
use handlergen::thread_handler_set::ThreadHandlerSet;
use handlergen::trace_file::write_trace_file;
use handlergen::transition::{State, StateTransition, StateTransitionType};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Fast,
    Comprehensive,
}

impl From<Mode> for HandlerMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fast => HandlerMode::Fast,
            Mode::Comprehensive => HandlerMode::Comprehensive,
        }
    }
}

/// Generate RISC-V exception handlers into a trace image
///
/// The handlers for every configured privilege level are generated
/// together with the boot code that installs them (trap vector
/// bases, save areas and exception delegation). The image is written
/// as a trace file with a .handlers section (ADDR INSTR # asm) and a
/// .bounds section (BANK NAME START END), and the address bounds of
/// the handlers in each memory bank are printed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to a TOML generator configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to output trace file
    #[arg(short, long)]
    output: PathBuf,

    /// Handler mode, overriding the configuration
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Register choice seed, overriding the configuration
    #[arg(short, long)]
    seed: Option<u64>,
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => GeneratorConfig::load_from_file(path)?,
        None => GeneratorConfig::default(),
    };
    if let Some(mode) = args.mode {
        config.handler_mode = mode.into();
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate()?;

    let mut seq = SimSequence::new(config.seed);
    seq.set_pc(config.boot_address);
    let mut handlers = ThreadHandlerSet::from_config(RiscvArchitecture::new(), &config)?;
    handlers.generate(&mut seq)?;

    let mut boot = State::new();
    for element in handlers.boot_state_elements()? {
        boot.add(element);
    }
    StateTransition::new_riscv().transition_to_state(&mut seq, &boot, StateTransitionType::Boot)?;

    write_trace_file(&args.output, seq.image(), handlers.registry())?;
    for bank in handlers.registry().banks() {
        println!("{bank}_bounds: {}", handlers.registry().bounds_report(bank));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
