//! Instruction helpers for a z/Architecture CPU.
//!
//! Generated code handles the regular instructions inline and calls into this crate for
//! everything else: variable-length storage operations, compare-and-swap, binary floating
//! point, and privileged system control. A helper receives the CPU state and a [`CpuBus`]
//! explicitly, updates the condition code in [`CpuState::cc`], and reports architected faults as
//! `Err(`[`Exception`]`)` so the caller can deliver a program interruption.
//!
//! Cross-CPU state (SIGP, the TOD clock, TLB broadcasts) lives in a shared [`Machine`]; each CPU
//! runs through a [`Vcpu`] obtained from it.

#![forbid(unsafe_code)]

pub mod cc;
pub mod exception;
pub mod exec;
pub mod fpu;
pub mod helpers;
pub mod interp;
pub mod interrupts;
pub mod machine;
pub mod mem;
pub mod paging_bus;
pub mod state;
pub mod system;

pub use exception::Exception;
pub use exec::{ex, Dispatch, Insn, Vcpu};
pub use helpers::HelperCall;
pub use interp::Completion;
pub use machine::{ConfigError, Hypervisor, Machine, MachineConfig, RunState, SigpResult};
pub use mem::{CpuBus, FlatTestBus, Space};
pub use paging_bus::PagingBus;
pub use state::{AddressSpace, AddressingMode, CpuState, Psw, PswMask};
