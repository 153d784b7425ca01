//! Simulated RISC-V hardware for the rvos teaching kernel.
//!
//! The kernel never touches host resources directly; everything it sees is
//! one of the devices assembled in [`Machine`]: a CPU register file, an MMU
//! in front of a fixed array of physical memory, an interrupt controller
//! driving simulated time, two raw disks, a console and a serial line
//! (ACIA). The instruction decoder itself lives *outside* this crate: user
//! execution is driven through the [`ExecutionEngine`] trait, one call per
//! simulated instruction.

pub mod acia;
pub mod config;
pub mod console;
pub mod disk;
pub mod elf;
pub mod interrupt;
pub mod mmu;
pub mod stats;
pub mod translation;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::acia::Acia;
use crate::config::Config;
use crate::console::Console;
use crate::disk::Disk;
use crate::interrupt::Interrupt;
use crate::mmu::Mmu;
use crate::stats::Stats;

/// Number of integer registers of the simulated processor.
pub const NUM_INT_REGS: usize = 32;
/// Number of floating-point registers of the simulated processor.
pub const NUM_FP_REGS: usize = 32;
/// Register holding the user stack pointer (RISC-V `sp`).
pub const STACK_REG: usize = 2;
/// Register holding the return address (RISC-V `ra`).
pub const RETADDR_REG: usize = 1;
/// Register carrying the system-call number (RISC-V `a7`).
pub const SYSCALL_REG: usize = 17;
/// First system-call argument / return-value register (RISC-V `a0`).
pub const ARG1_REG: usize = 10;
/// Second system-call argument register.
pub const ARG2_REG: usize = 11;
/// Third system-call argument register.
pub const ARG3_REG: usize = 12;
/// Fourth system-call argument register.
pub const ARG4_REG: usize = 13;

/// Exceptions the simulated processor can raise while running user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// Everything ok.
    NoException,
    /// A program executed a system call.
    Syscall,
    /// Access to a mapped page that is not resident.
    PageFault,
    /// Write attempted on a page marked read-only.
    ReadOnly,
    /// Translation produced an invalid physical address.
    BusError,
    /// Reference outside the address space, or to an unmapped page.
    AddressError,
    /// Integer overflow in add or sub.
    Overflow,
    /// Unimplemented or reserved instruction.
    IllegalInstruction,
}

/// What the machine is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Nothing runnable.
    Idle,
    /// Kernel code.
    System,
    /// User code.
    User,
}

/// Saved processor state of one thread of execution.
#[derive(Debug, Clone)]
pub struct CpuContext {
    /// Integer register file.
    pub int_registers: [i64; NUM_INT_REGS],
    /// Floating-point register file.
    pub float_registers: [i64; NUM_FP_REGS],
    /// Program counter.
    pub pc: i64,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            int_registers: [0; NUM_INT_REGS],
            float_registers: [0; NUM_FP_REGS],
            pc: 0,
        }
    }
}

/// The register file of the simulated CPU.
///
/// There is a single set of live registers; the scheduler saves and restores
/// whole [`CpuContext`]s around context switches.
pub struct Cpu {
    context: Mutex<CpuContext>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            context: Mutex::new(CpuContext::default()),
        }
    }

    pub fn read_int_register(&self, num: usize) -> i64 {
        assert!(num < NUM_INT_REGS);
        self.context.lock().unwrap().int_registers[num]
    }

    /// Store a value into an integer CPU register. Register 0 is hardwired
    /// to zero.
    pub fn write_int_register(&self, num: usize, value: i64) {
        assert!(num < NUM_INT_REGS);
        if num != 0 {
            self.context.lock().unwrap().int_registers[num] = value;
        }
    }

    pub fn read_fp_register(&self, num: usize) -> i64 {
        assert!(num < NUM_FP_REGS);
        self.context.lock().unwrap().float_registers[num]
    }

    pub fn write_fp_register(&self, num: usize, value: i64) {
        assert!(num < NUM_FP_REGS);
        self.context.lock().unwrap().float_registers[num] = value;
    }

    pub fn pc(&self) -> i64 {
        self.context.lock().unwrap().pc
    }

    pub fn set_pc(&self, pc: i64) {
        self.context.lock().unwrap().pc = pc;
    }

    /// Snapshot the live register file (context-switch save).
    pub fn save_context(&self) -> CpuContext {
        self.context.lock().unwrap().clone()
    }

    /// Overwrite the live register file (context-switch restore).
    pub fn restore_context(&self, ctx: &CpuContext) {
        *self.context.lock().unwrap() = ctx.clone();
    }
}

/// The simulated machine: CPU, MMU + physical memory, interrupt controller,
/// two disks (file system and swap), console and serial line.
pub struct Machine {
    pub cfg: Arc<Config>,
    pub stats: Arc<Stats>,
    pub interrupt: Arc<Interrupt>,
    pub cpu: Arc<Cpu>,
    pub mmu: Arc<Mmu>,
    /// Raw device holding the file system.
    pub disk: Arc<Disk>,
    /// Raw device holding the swap area.
    pub disk_swap: Arc<Disk>,
    pub console: Arc<Console>,
    pub acia: Arc<Acia>,
    status: Mutex<MachineStatus>,
}

impl Machine {
    /// Assemble a machine from a configuration. `disk_path` and
    /// `swap_path` name the host files backing the two disk units; fresh
    /// images are created and stamped on first use.
    pub fn new(
        cfg: Arc<Config>,
        disk_path: &std::path::Path,
        swap_path: &std::path::Path,
    ) -> std::io::Result<Arc<Machine>> {
        let stats = Arc::new(Stats::new());
        let interrupt = Arc::new(Interrupt::new(stats.clone()));
        let mmu = Arc::new(Mmu::new(cfg.clone(), stats.clone()));
        let disk = Arc::new(Disk::new(
            "disk",
            disk_path,
            cfg.sector_size,
            interrupt.clone(),
            stats.clone(),
        )?);
        let disk_swap = Arc::new(Disk::new(
            "swap disk",
            swap_path,
            cfg.sector_size,
            interrupt.clone(),
            stats.clone(),
        )?);
        let console = Arc::new(Console::new(interrupt.clone(), stats.clone()));
        let acia = Arc::new(Acia::new(interrupt.clone()));
        Ok(Arc::new(Machine {
            cfg,
            stats,
            interrupt,
            cpu: Arc::new(Cpu::new()),
            mmu,
            disk,
            disk_swap,
            console,
            acia,
            status: Mutex::new(MachineStatus::System),
        }))
    }

    pub fn status(&self) -> MachineStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: MachineStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Shut the machine down: print the statistics report when configured,
    /// then terminate the host process with `code`.
    pub fn halt(&self, code: i32) -> ! {
        if self.cfg.print_stat {
            print!("{}", self.stats.report());
        }
        std::process::exit(code)
    }
}

/// One step of the external instruction-set simulator.
#[derive(Debug)]
pub enum Step {
    /// The instruction retired, consuming `cycles` of simulated time.
    Executed { cycles: u64 },
    /// The instruction trapped. The program counter was not advanced; the
    /// kernel resolves the exception and the same instruction re-executes.
    Raise { exception: ExceptionType, vaddr: u64 },
}

/// The boundary to the RISC-V instruction decoder, which lives outside this
/// workspace. One call executes one user instruction against the machine's
/// registers and MMU.
pub trait ExecutionEngine: Send {
    fn step(&mut self, machine: &Machine) -> Step;
}

/// A single scripted user instruction, for [`ScriptedEngine`].
#[derive(Debug, Clone)]
pub enum ScriptOp {
    /// Write an integer register.
    SetReg(usize, i64),
    /// Load `size` bytes from a user virtual address.
    Load(u64, usize),
    /// Store `size` bytes of `value` at a user virtual address.
    Store(u64, usize, u64),
    /// Load one byte and write it to the given register.
    LoadTo(u64, usize),
    /// Trap into the kernel with the current register state.
    Syscall,
}

/// A deterministic stand-in for the external decoder: replays a fixed
/// instruction sequence. A faulting access stays at the front of the script
/// so the kernel's fault resolution is followed by a genuine re-execution.
pub struct ScriptedEngine {
    ops: VecDeque<ScriptOp>,
}

impl ScriptedEngine {
    pub fn new(ops: impl IntoIterator<Item = ScriptOp>) -> Self {
        Self {
            ops: ops.into_iter().collect(),
        }
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn step(&mut self, machine: &Machine) -> Step {
        let Some(op) = self.ops.front().cloned() else {
            // Ran off the end of the program text.
            return Step::Raise {
                exception: ExceptionType::IllegalInstruction,
                vaddr: machine.cpu.pc() as u64,
            };
        };
        let outcome = match op {
            ScriptOp::SetReg(num, value) => {
                machine.cpu.write_int_register(num, value);
                Step::Executed { cycles: 1 }
            }
            ScriptOp::Load(addr, size) => match machine.mmu.read_mem(addr, size) {
                Ok(_) => Step::Executed { cycles: 1 },
                Err(fault) => Step::Raise {
                    exception: fault.exception,
                    vaddr: fault.vaddr,
                },
            },
            ScriptOp::LoadTo(addr, reg) => match machine.mmu.read_mem(addr, 1) {
                Ok(value) => {
                    machine.cpu.write_int_register(reg, value as i64);
                    Step::Executed { cycles: 1 }
                }
                Err(fault) => Step::Raise {
                    exception: fault.exception,
                    vaddr: fault.vaddr,
                },
            },
            ScriptOp::Store(addr, size, value) => match machine.mmu.write_mem(addr, size, value) {
                Ok(()) => Step::Executed { cycles: 1 },
                Err(fault) => Step::Raise {
                    exception: fault.exception,
                    vaddr: fault.vaddr,
                },
            },
            ScriptOp::Syscall => Step::Raise {
                exception: ExceptionType::Syscall,
                vaddr: 0,
            },
        };
        match outcome {
            Step::Executed { .. } => {
                self.ops.pop_front();
                let pc = machine.cpu.pc();
                machine.cpu.set_pc(pc + 4);
                outcome
            }
            Step::Raise {
                exception: ExceptionType::Syscall,
                ..
            } => {
                // The trap consumes the instruction; the handlers resume at
                // the next one.
                self.ops.pop_front();
                outcome
            }
            Step::Raise { .. } => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::TranslationTable;

    fn test_machine(tag: &str) -> Arc<Machine> {
        let base = std::env::temp_dir().join(format!(
            "rvos-machine-{}-{tag}",
            std::process::id()
        ));
        let disk = base.with_extension("disk");
        let swap = base.with_extension("swap");
        let _ = std::fs::remove_file(&disk);
        let _ = std::fs::remove_file(&swap);
        Machine::new(Arc::new(Config::default()), &disk, &swap).unwrap()
    }

    #[test]
    fn register_zero_is_hardwired() {
        let machine = test_machine("regs");
        machine.cpu.write_int_register(0, 42);
        assert_eq!(machine.cpu.read_int_register(0), 0);
        machine.cpu.write_int_register(5, 42);
        assert_eq!(machine.cpu.read_int_register(5), 42);
    }

    #[test]
    fn scripted_engine_replays_a_faulting_access() {
        let machine = test_machine("engine");
        let table = Arc::new(TranslationTable::new(4));
        table.update(0, |e| {
            e.read_allowed = true;
            e.write_allowed = true;
        });
        machine.mmu.set_translation(Some(table.clone()));

        let mut engine = ScriptedEngine::new([ScriptOp::Store(8, 1, 0x77), ScriptOp::Syscall]);
        // First attempt faults: the page is not resident.
        match engine.step(&machine) {
            Step::Raise { exception, vaddr } => {
                assert_eq!(exception, ExceptionType::PageFault);
                assert_eq!(vaddr, 8);
            }
            other => panic!("expected a fault, got {other:?}"),
        }
        // "Resolve" the fault the way the kernel would, then re-execute.
        table.update(0, |e| {
            e.valid = true;
            e.physical_page = 1;
        });
        match engine.step(&machine) {
            Step::Executed { .. } => {}
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(machine.mmu.read_mem(8, 1).unwrap(), 0x77);
        match engine.step(&machine) {
            Step::Raise { exception, .. } => assert_eq!(exception, ExceptionType::Syscall),
            other => panic!("expected a trap, got {other:?}"),
        }
        machine.mmu.set_translation(None);
    }

    #[test]
    fn exhausted_script_raises_illegal_instruction() {
        let machine = test_machine("exhausted");
        let mut engine = ScriptedEngine::new([]);
        match engine.step(&machine) {
            Step::Raise { exception, .. } => {
                assert_eq!(exception, ExceptionType::IllegalInstruction)
            }
            other => panic!("unexpected step {other:?}"),
        }
    }
}
