mod snapshot;

use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, Subcommand};
use stackroots_core::dump::GcInfoDumper;
use stackroots_core::eh::{EhEnumState, TypeReference};
use stackroots_core::gcinfo::GcInfoHeader;
use stackroots_core::gcref::{self, CallsiteTables, DeltaShortcuts, RootContext};
use stackroots_core::image::ModuleImage;
use stackroots_core::memory::SnapshotMemory;
use stackroots_core::regdisplay::{regs, RegDisplay};
use stackroots_core::walker::{WalkSummary, WalkerConfig};
use stackroots_core::{Address, Architecture, Registry, StackWalker, WalkError};
use stackroots_utils::{debug, info, init_logging, init_logging_with_level, LogFormat, LogLevel};

use crate::snapshot::{parse_hex, read_input, Snapshot};

/// Decode GC tables and walk managed stacks of AOT-compiled code.
#[derive(Parser, Debug)]
#[command(name = "stackroots")]
#[command(version)]
#[command(about = "Decode GC tables and walk managed stacks of AOT-compiled code", long_about = None)]
struct Cli
{
    /// More log output (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Log format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Print the GC-info header of a method
    Header
    {
        /// Target architecture (x86, x64, arm, arm64)
        #[arg(long)]
        arch: Architecture,
        /// GC info as hex bytes or @file
        input: String,
        /// Code offset selecting a funclet header (hex)
        #[arg(long, default_value = "0")]
        offset: String,
    },
    /// Print the header, epilog table and callsite map of a method
    Dump
    {
        #[arg(long)]
        arch: Architecture,
        /// GC info as hex bytes or @file
        input: String,
        /// The module's 16-byte delta shortcut table as hex
        #[arg(long)]
        shortcuts: String,
        /// The module's callsite strings as hex bytes or @file
        #[arg(long)]
        strings: String,
        /// Method size in bytes (hex), needed for an epilog at the end
        #[arg(long, default_value = "0")]
        code_size: String,
    },
    /// List the EH clauses of a method
    Eh
    {
        /// EH info as hex bytes or @file
        input: String,
        /// Method start address (hex)
        #[arg(long)]
        method_start: String,
        /// Module base that type RVAs are relative to (hex)
        #[arg(long)]
        module_base: String,
    },
    /// Decode a callsite string and list the slots it reports
    Callsite
    {
        #[arg(long)]
        arch: Architecture,
        /// Callsite string as hex bytes
        input: String,
        /// Stack pointer of the frame (hex)
        #[arg(long)]
        sp: String,
        /// Frame pointer of the frame (hex); local slots need it
        #[arg(long)]
        fp: Option<String>,
    },
    /// Walk a captured thread snapshot
    Walk
    {
        /// Snapshot file of key=value lines
        snapshot: PathBuf,
        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<usize>,
        /// Validate legacy epilogs before unwinding
        #[arg(long)]
        verify_epilogs: bool,
        /// Log frames in unboxing stubs
        #[arg(long)]
        report_stubs: bool,
    },
}

fn main()
{
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }
    debug!(rustc = stackroots_core::RUSTC_VERSION.unwrap_or("unknown"), "stackroots starting");

    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn setup_logging(cli: &Cli) -> Result<(), stackroots_utils::LoggingError>
{
    if !cli.quiet && cli.verbose == 0 && cli.log_format.is_none() {
        // RUST_LOG and STACKROOTS_LOG_FORMAT decide
        return init_logging();
    }
    let level = if cli.quiet {
        LogLevel::Error
    } else {
        LogLevel::Info.more_verbose(cli.verbose)
    };
    init_logging_with_level(level, cli.log_format.unwrap_or(LogFormat::Pretty))
}

fn run_command(cli: Cli) -> Result<(), WalkError>
{
    match cli.command {
        Commands::Header { arch, input, offset } => {
            let bytes = read_input(&input, None)?;
            let offset = hex_u32(&offset)?;
            let (header, size) = GcInfoHeader::decode(arch, &bytes, offset)?;
            debug!(size, "decoded header");
            let shortcuts = DeltaShortcuts([0; 16]);
            let tables = CallsiteTables {
                shortcuts: &shortcuts,
                strings: &[],
            };
            print!("{}", GcInfoDumper::new(arch, tables).dump_header(&header));
            Ok(())
        }
        Commands::Dump {
            arch,
            input,
            shortcuts,
            strings,
            code_size,
        } => {
            let bytes = read_input(&input, None)?;
            let shortcuts = DeltaShortcuts::from_slice(&read_input(&shortcuts, None)?)?;
            let strings = read_input(&strings, None)?;
            let tables = CallsiteTables {
                shortcuts: &shortcuts,
                strings: &strings,
            };
            print!("{}", GcInfoDumper::new(arch, tables).dump(&bytes, hex_u32(&code_size)?)?);
            Ok(())
        }
        Commands::Eh {
            input,
            method_start,
            module_base,
        } => {
            let bytes = read_input(&input, None)?;
            let method_start = Address::new(parse_hex(&method_start)?);
            let module_base = Address::new(parse_hex(&module_base)?);
            let image = ModuleImage::new(Architecture::Amd64, module_base).with_section(".eh", module_base, bytes);
            let mut state =
                EhEnumState::new(&image, method_start, module_base, TypeReference::ModuleRva { module_base })?;
            println!("clauses ({})", state.count());
            for clause in state.collect_all(&image)? {
                let handler = clause
                    .handler_offset()
                    .map_or_else(String::new, |offset| format!(" handler {offset:04x}"));
                let filter = clause
                    .filter_offset()
                    .map_or_else(String::new, |offset| format!(" filter {offset:04x}"));
                println!(
                    "  {:<8} try {:04x}..{:04x}{handler}{filter}",
                    clause.kind().to_string(),
                    clause.try_start_offset,
                    clause.try_end_offset
                );
            }
            Ok(())
        }
        Commands::Callsite { arch, input, sp, fp } => {
            let strings = read_input(&input, None)?;
            let mut memory = SnapshotMemory::new();
            let mut display = RegDisplay::new(arch);
            display.sp = Address::new(parse_hex(&sp)?);
            let mut header = GcInfoHeader::new(arch);
            if let Some(fp) = fp {
                header.has_frame_pointer = true;
                display.spill(&mut memory, Address::new(0x1000), regs::frame_register(arch), parse_hex(&fp)?);
            }

            let ctx = RootContext {
                header: &header,
                display: &display,
                memory: &memory,
            };
            for descriptor in gcref::decode_string(&strings, 0)? {
                println!("{descriptor:?}");
                gcref::report_descriptor(&ctx, &descriptor, &mut |root| {
                    println!("  slot {} {:?}", root.slot, root.flags);
                })?;
            }
            Ok(())
        }
        Commands::Walk {
            snapshot,
            max_frames,
            verify_epilogs,
            report_stubs,
        } => {
            let snapshot = Snapshot::load(&snapshot)?;
            let registry = Registry::new();
            if let Some(image) = snapshot.module {
                let code_range = image
                    .code_range()
                    .ok_or_else(|| WalkError::InvalidArgument("snapshot module has no .text".to_string()))?;
                let stubs = image.unboxing_stub_range().unwrap_or((Address::ZERO, 0));
                if !registry.register_os_module(image, code_range, stubs, &[]) {
                    return Err(WalkError::InvalidArgument("snapshot module was not registered".to_string()));
                }
            }

            let mut config = WalkerConfig::from_runtime_config();
            if let Some(max_frames) = max_frames {
                config.max_frames = max_frames;
            }
            config.verify_epilogs |= verify_epilogs;
            config.report_unboxing_stubs |= report_stubs;

            let walker = StackWalker::new(&registry, &snapshot.memory, config);
            let summary = if snapshot.from_fault {
                walker.walk_from_fault(snapshot.display)?
            } else {
                walker.walk(snapshot.display)?
            };
            print_summary(&summary);
            info!(frames = summary.frames.len(), roots = summary.root_count(), "walk complete");
            Ok(())
        }
    }
}

fn hex_u32(text: &str) -> Result<u32, WalkError>
{
    u32::try_from(parse_hex(text)?).map_err(|_| WalkError::InvalidArgument(format!("'{text}' does not fit 32 bits")))
}

fn print_summary(summary: &WalkSummary)
{
    for (index, frame) in summary.frames.iter().enumerate() {
        if frame.unboxing_stub {
            println!("#{index:<3} ip {} sp {} (unboxing stub)", frame.ip, frame.sp);
            continue;
        }
        let method = frame.method_start.map_or_else(|| "?".to_string(), |start| start.to_string());
        let kind = frame.funclet_kind.map_or("?", |kind| kind.name());
        println!("#{index:<3} ip {} sp {} method {method} {kind}", frame.ip, frame.sp);
        for root in &frame.roots {
            println!("       root {} {:?}", root.slot, root.flags);
        }
    }
    println!("end: {}", summary.end);
}
