//! rvos: a pedagogical operating-system kernel running user RISC-V
//! programs on a simulated machine.
//!
//! The kernel multiplexes cooperatively scheduled threads over one
//! simulated CPU, serves demand-paged virtual memory backed by a swap
//! disk, and keeps a block-addressed file system on a second disk. User
//! code enters through traps: the system-call dispatcher and the page
//! fault path in [`syscall`].
//!
//! Every subsystem hangs off a single [`Kernel`] value threaded through
//! constructors and call sites; there are no process-wide singletons.

pub mod drivers;
pub mod error;
pub mod fs;
pub mod object;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod thread;
pub mod vm;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rvos_machine::config::{AciaMode, Config};
use rvos_machine::interrupt::{IntStatus, Interrupt};
use rvos_machine::{ExecutionEngine, Machine, ScriptOp, ScriptedEngine, SYSCALL_REG};

use crate::drivers::{DriverAcia, DriverConsole, DriverDisk};
use crate::error::{ErrorKind, ErrorSlot};
use crate::fs::FileSystem;
use crate::object::{KernelObject, ObjectRegistry};
use crate::process::Process;
use crate::thread::scheduler::Scheduler;
use crate::thread::Thread;
use crate::vm::{PageFaultManager, PhysicalMemManager, SwapManager};

/// Period of the timer interrupt driving the yield-on-return illusion of
/// preemption.
const TIMER_TICKS: u64 = 100;

type EngineFactory = Box<dyn Fn() -> Box<dyn ExecutionEngine> + Send + Sync>;

/// The kernel context: machine, scheduler, drivers, file system, virtual
/// memory and the dispatcher state, assembled once at boot.
pub struct Kernel {
    pub cfg: Arc<Config>,
    pub machine: Arc<Machine>,
    pub scheduler: Arc<Scheduler>,
    pub disk_driver: Arc<DriverDisk>,
    pub swap_driver: Arc<DriverDisk>,
    pub console: Arc<DriverConsole>,
    pub acia: Option<Arc<DriverAcia>>,
    pub filesystem: Arc<FileSystem>,
    pub swap: Arc<SwapManager>,
    pub physmem: Arc<PhysicalMemManager>,
    pub pagefault: Arc<PageFaultManager>,
    pub objects: ObjectRegistry,
    pub last_error: ErrorSlot,
    engine_factory: Mutex<EngineFactory>,
}

impl Kernel {
    /// Bring the machine and every kernel subsystem up. The calling host
    /// thread becomes the initial kernel thread.
    pub fn bootstrap(
        mut cfg: Config,
        disk_path: &Path,
        swap_path: &Path,
    ) -> std::io::Result<Arc<Kernel>> {
        cfg.validate().expect("invalid configuration");
        let cfg = Arc::new(cfg);
        if cfg.target_machine_name.is_empty() {
            log::info!("booting: {cfg}");
        } else {
            log::info!("booting \"{}\": {cfg}", cfg.target_machine_name);
        }
        let machine = Machine::new(cfg.clone(), disk_path, swap_path)?;
        let scheduler = Scheduler::new(machine.clone());
        scheduler.attach_main("main");
        schedule_timer(&machine.interrupt);

        let disk_driver = DriverDisk::new(
            "sem disk",
            "lock disk",
            machine.disk.clone(),
            &scheduler,
        );
        let swap_driver = DriverDisk::new(
            "sem swap disk",
            "lock swap disk",
            machine.disk_swap.clone(),
            &scheduler,
        );
        let console = DriverConsole::new(machine.console.clone(), &scheduler);
        let acia = match cfg.acia {
            AciaMode::None => None,
            mode => Some(DriverAcia::new(machine.acia.clone(), mode, &scheduler)),
        };

        let swap = SwapManager::new(swap_driver.clone());
        let physmem = PhysicalMemManager::new(cfg.clone(), machine.mmu.clone(), swap.clone());
        let pagefault = PageFaultManager::new(
            cfg.clone(),
            machine.mmu.clone(),
            physmem.clone(),
            swap.clone(),
            scheduler.clone(),
            machine.stats.clone(),
        );
        let filesystem = FileSystem::new(
            cfg.clone(),
            disk_driver.clone(),
            scheduler.clone(),
            cfg.format_disk,
        );
        machine.interrupt.set_level(IntStatus::On);

        Ok(Arc::new(Kernel {
            cfg,
            machine,
            scheduler,
            disk_driver,
            swap_driver,
            console,
            acia,
            filesystem,
            swap,
            physmem,
            pagefault,
            objects: ObjectRegistry::new(),
            last_error: ErrorSlot::new(),
            engine_factory: Mutex::new(Box::new(default_engine)),
        }))
    }

    /// Spawn a kernel thread running `f`.
    pub fn spawn(
        self: &Arc<Self>,
        name: &str,
        f: impl FnOnce(&Arc<Kernel>) + Send + 'static,
    ) -> Arc<Thread> {
        let thread = Thread::new(name, &self.scheduler);
        let kernel = self.clone();
        let tcb = thread.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tcb.gate_wait();
                kernel.scheduler.interrupt().set_level(IntStatus::On);
                f(&kernel);
                kernel.scheduler.finish_current();
            })
            .expect("host thread spawn failed");
        self.scheduler.ready_to_run(thread.clone());
        thread
    }

    /// Instantiate the instruction-set engine a fresh user thread runs
    /// on. The decode loop is external; the default stands in by exiting
    /// immediately.
    pub fn make_engine(&self) -> Box<dyn ExecutionEngine> {
        (*self.engine_factory.lock().unwrap())()
    }

    /// Replace the engine factory (test harnesses, external simulators).
    pub fn set_engine_factory(
        &self,
        factory: impl Fn() -> Box<dyn ExecutionEngine> + Send + Sync + 'static,
    ) {
        *self.engine_factory.lock().unwrap() = Box::new(factory);
    }

    /// Load the executable at `path` into a new process and start its
    /// master thread. Returns the thread and its registry identifier.
    pub fn start_program(
        self: &Arc<Self>,
        path: &str,
    ) -> Result<(Arc<Thread>, i32), ErrorKind> {
        let process = Process::new(self, path)?;
        let thread = Thread::new(path, &self.scheduler);
        let entry = process.code_start_address() as i64;
        thread.start(self, process, entry, -1)?;
        let tid = self.objects.add(KernelObject::Thread(thread.clone()));
        Ok((thread, tid))
    }

    /// Perform the configuration-driven startup actions, in the order the
    /// configuration defines them: remove, mkdir, rmdir, host copies,
    /// file print, directory listing, file-system dump.
    pub fn startup_actions(self: &Arc<Self>) {
        let cfg = self.cfg.clone();
        if let Some(path) = &cfg.file_to_remove {
            if let Err(e) = self.filesystem.remove(path) {
                log::warn!(target: "fs", "startup remove {path}: {e}");
            }
        }
        if let Some(path) = &cfg.dir_to_make {
            if let Err(e) = self.filesystem.mkdir(path) {
                log::warn!(target: "fs", "startup mkdir {path}: {e}");
            }
        }
        if let Some(path) = &cfg.dir_to_remove {
            if let Err(e) = self.filesystem.rmdir(path) {
                log::warn!(target: "fs", "startup rmdir {path}: {e}");
            }
        }
        for copy in &cfg.files_to_copy {
            if self
                .filesystem
                .copy_from_host(Path::new(&copy.host_path), &copy.guest_path)
                .is_err()
            {
                eprintln!("Copy: couldn't copy {} to {}", copy.host_path, copy.guest_path);
                self.machine.halt(-1);
            }
        }
        if let Some(path) = &cfg.file_to_print {
            match self.filesystem.print_file(path) {
                Ok(dump) => self.console.put_string(dump.as_bytes()),
                Err(_) => {
                    let msg = format!("Print: unable to open file {path}\n");
                    self.console.put_string(msg.as_bytes());
                }
            }
        }
        if cfg.list_dir {
            let listing = self.filesystem.list();
            self.console.put_string(listing.as_bytes());
        }
        if cfg.print_file_syst {
            let dump = self.filesystem.print();
            self.console.put_string(dump.as_bytes());
        }
    }
}

/// The stand-in engine: one `Exit` system call.
fn default_engine() -> Box<dyn ExecutionEngine> {
    Box::new(ScriptedEngine::new([
        ScriptOp::SetReg(SYSCALL_REG, syscall::nr::EXIT),
        ScriptOp::Syscall,
    ]))
}

/// Rearm the periodic timer; its handler requests a yield between user
/// instructions, giving the illusion of preemption.
fn schedule_timer(interrupt: &Arc<Interrupt>) {
    let rearm = interrupt.clone();
    interrupt.schedule(
        TIMER_TICKS,
        Box::new(move || {
            rearm.set_yield_on_return();
            schedule_timer(&rearm);
        }),
    );
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared scaffolding for the kernel tests: each test boots its own
    //! kernel on private disk images.

    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use rvos_machine::config::Config;

    use crate::thread::scheduler::Scheduler;
    use crate::Kernel;

    static SEQ: AtomicU64 = AtomicU64::new(0);

    pub fn unique_disk_paths(tag: &str) -> (PathBuf, PathBuf) {
        let seq = SEQ.fetch_add(1, Ordering::SeqCst);
        let base = std::env::temp_dir().join(format!(
            "rvos-test-{}-{seq}-{tag}",
            std::process::id()
        ));
        let disk = base.with_extension("disk");
        let swap = base.with_extension("swap");
        let _ = std::fs::remove_file(&disk);
        let _ = std::fs::remove_file(&swap);
        (disk, swap)
    }

    pub fn test_config() -> Config {
        Config {
            format_disk: true,
            ..Config::default()
        }
    }

    pub fn boot_with(cfg: Config, tag: &str) -> Arc<Kernel> {
        let (disk, swap) = unique_disk_paths(tag);
        Kernel::bootstrap(cfg, &disk, &swap).expect("bootstrap failed")
    }

    pub fn boot(tag: &str) -> Arc<Kernel> {
        boot_with(test_config(), tag)
    }

    pub fn bare_scheduler() -> Arc<Scheduler> {
        boot("bare").scheduler.clone()
    }
}
