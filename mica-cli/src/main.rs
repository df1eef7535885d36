use std::fs::File;
use std::process::ExitCode;

use clap::Parser;
use log::{debug, info};
use stderrlog::LogLevelNum;

use mica_core::engine::{Engine, EngineConfig, StopEvent};
use mica_core::instruction::DecodedInstruction;
use mica_core::machine::{Console, MachineState};
use mica_core::memory::MemoryLayout;
use mica_core::registers::Specifier;
use mica_core::MachineWidth;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Flat binary image of little-endian instruction words, loaded at the
    /// start of the text segment.
    binary: String,
    /// Memory layout to simulate under ("default" or "compact").
    #[arg(short, long, default_value = "default")]
    layout: String,
    /// Simulate a 64-bit machine instead of a 32-bit one.
    #[arg(long)]
    rv64: bool,
    /// Stop after this many executed instructions.
    #[arg(short, long)]
    max_steps: Option<u64>,
    /// Break when the program counter reaches this address; repeatable.
    #[arg(short, long = "break", value_parser = parse_address)]
    breakpoints: Vec<u64>,
    /// Cap on executed instructions per second.
    #[arg(short, long)]
    rate: Option<u64>,
    /// Allow the program to overwrite its own text segment.
    #[arg(long)]
    smc: bool,
    /// Dump the integer registers when the run stops.
    #[arg(short, long)]
    dump_registers: bool,
    /// Log verbosity; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_address(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> std::io::Result<ExitCode> {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(LogLevelNum::from(args.verbose as usize + 1))
        .modules([module_path!(), "mica_core"])
        .init()
        .unwrap();

    let Some(layout) = MemoryLayout::by_name(&args.layout) else {
        eprintln!("unknown layout {:?}", args.layout);
        return Ok(ExitCode::FAILURE);
    };
    let width = if args.rv64 {
        MachineWidth::Rv64
    } else {
        MachineWidth::Rv32
    };

    let mut image = Vec::new();
    use std::io::Read;
    File::open(&args.binary)?.read_to_end(&mut image)?;

    let mut machine = MachineState::new(width, layout);
    machine.memory_mut().set_smc_enabled(args.smc);
    load_image(&mut machine, &image);

    let start = layout.text.start();
    let engine = Engine::new(
        machine,
        Box::new(Console::stdout()),
        EngineConfig {
            max_steps_per_second: args.rate,
        },
    );

    info!("starting at {start:#x}");
    let event = engine.run(start, args.max_steps, &args.breakpoints);

    if args.dump_registers {
        engine.with_machine(dump_registers);
    }

    Ok(report(&engine, event))
}

/// Loads a flat image of little-endian instruction words at the base of the
/// text segment. A trailing partial word is zero-padded.
fn load_image(machine: &mut MachineState, image: &[u8]) {
    let base = machine.memory().layout().text.start();
    for (i, chunk) in image.chunks(4).enumerate() {
        let mut bytes = [0u8; 4];
        bytes[..chunk.len()].copy_from_slice(chunk);
        let word = u32::from_le_bytes(bytes);
        let address = base + 4 * i as u64;
        let record = DecodedInstruction::from_raw(word, address);
        if let Err(fault) = machine.memory_mut().write_instruction(address, record) {
            debug!("image does not fit the text segment: {fault}");
            break;
        }
    }
    debug!("loaded {} bytes at {base:#x}", image.len());
}

fn dump_registers(machine: &mut MachineState) {
    eprintln!("pc  = {:#018x}", machine.pc());
    for specifier in Specifier::iter_all() {
        eprintln!("{specifier:<3} = {:#018x}", machine.read_x(specifier));
    }
}

fn report(engine: &Engine, event: StopEvent) -> ExitCode {
    match event {
        StopEvent::Exited { code } => {
            info!("program exited with code {code}");
            ExitCode::from(code as u8)
        }
        StopEvent::BreakpointHit { address } => {
            eprintln!("breakpoint hit at {address:#x}");
            ExitCode::SUCCESS
        }
        StopEvent::MaxStepsHit => {
            eprintln!(
                "step limit reached at {:#x}",
                engine.with_machine(|machine| machine.pc())
            );
            ExitCode::SUCCESS
        }
        StopEvent::CliffTermination { address } => {
            eprintln!("execution ran off the end of the program at {address:#x}");
            ExitCode::FAILURE
        }
        StopEvent::Paused | StopEvent::Stopped => ExitCode::SUCCESS,
        StopEvent::ErrorHit(error) => {
            eprintln!("unrecoverable error: {error}");
            ExitCode::FAILURE
        }
    }
}
