//! Boot the kernel: command line, configuration, startup actions, and the
//! initial user program.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use rvos::Kernel;
use rvos_machine::config::Config;

/// Default configuration file, looked up in the working directory.
const DEFAULT_CONFIG: &str = "rvos.cfg";
/// Host files backing the two disk units.
const DISK_FILE: &str = "DISK";
const SWAP_FILE: &str = "DISK_swap";

#[derive(Parser)]
#[command(name = "rvos", about = "A teaching operating system on a simulated RISC-V machine")]
struct Args {
    /// Debug category flags: t=threads, s=synchronization, f=file system,
    /// v=virtual memory, e=system calls, m=machine, d=drivers, + for all
    #[arg(short = 'd', value_name = "flags")]
    debug: Option<String>,

    /// Execute user programs in single-step mode
    #[arg(short = 's')]
    single_step: bool,

    /// Executable to run (overrides the configuration file)
    #[arg(short = 'x', value_name = "elf")]
    executable: Option<String>,

    /// Print copyright information and exit
    #[arg(short = 'z')]
    copyright: bool,

    /// Alternate configuration file
    #[arg(short = 'f', value_name = "cfg")]
    config: Option<PathBuf>,
}

fn init_logging(flags: Option<&str>) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(flags) = flags {
        for flag in flags.chars() {
            let target = match flag {
                't' => "thread",
                's' => "sync",
                'f' => "fs",
                'v' => "vm",
                'e' => "exc",
                'm' => "machine",
                'd' => "drv",
                '+' => {
                    builder.filter_level(LevelFilter::Trace);
                    continue;
                }
                other => {
                    eprintln!("unknown debug flag '{other}'");
                    continue;
                }
            };
            builder.filter(Some(target), LevelFilter::Trace);
        }
    }
    builder.init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path).with_context(|| "loading configuration"),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                Config::from_file(default).with_context(|| "loading configuration")
            } else {
                log::warn!("no {DEFAULT_CONFIG} found, using built-in defaults");
                Ok(Config::default())
            }
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let cfg = load_config(args.config.as_deref())?;
    if args.single_step {
        log::info!("single-step mode requested; effective once an external engine is attached");
    }

    let kernel = Kernel::bootstrap(cfg, Path::new(DISK_FILE), Path::new(SWAP_FILE))
        .context("machine bring-up failed")?;
    kernel.machine.console.set_echo(true);
    kernel.startup_actions();

    let program = args
        .executable
        .clone()
        .or_else(|| {
            let configured = kernel.cfg.program_to_run.clone();
            (!configured.is_empty()).then_some(configured)
        });
    match program {
        None => println!("Warning: no program to start"),
        Some(path) => match kernel.start_program(&path) {
            Ok((thread, tid)) => {
                log::info!("started {path} (thread id {tid})");
                thread.join();
            }
            Err(e) => {
                eprintln!("Unable to start initial process {path}: {e}");
                std::process::exit(-1);
            }
        },
    }
    kernel.machine.halt(0)
}

fn main() {
    let args = Args::parse();
    if args.copyright {
        println!(
            "rvos {} -- a teaching operating system on a simulated RISC-V machine",
            env!("CARGO_PKG_VERSION")
        );
        println!("Distributed under the GNU General Public License, version 3.");
        return;
    }
    init_logging(args.debug.as_deref());
    if let Err(e) = run(&args) {
        eprintln!("rvos: {e:#}");
        std::process::exit(-1);
    }
}
