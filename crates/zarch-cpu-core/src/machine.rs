//! Configuration-wide state shared by all CPUs.
//!
//! The [`Machine`] owns guest storage, the time-of-day clock and one slot per CPU address. A slot
//! carries the CPU's run state as seen by SIGP, its TLB (so other CPUs can purge it) and a mailbox
//! of requests that the owning [`Vcpu`] applies at its next instruction boundary. Everything that
//! crosses CPUs is serialized by one mutex.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zarch_mem::{GuestRam, MemError, Tlb, PREFIX_AREA_SIZE};
use zarch_time::{HostClock, StdHostClock, TodClock, TodClockConfig};

use crate::exec::Vcpu;
use crate::paging_bus::PagingBus;
use crate::state::{CpuState, PREFIX_MASK};

/// Highest number of CPUs a configuration may have.
pub const MAX_CPUS: u16 = 64;

/// Storage is configured in 1 MiB increments.
pub const STORAGE_INCREMENT: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Number of CPUs; CPU addresses run from 0 to `cpus - 1`.
    pub cpus: u16,
    /// Main storage size in bytes.
    pub storage_size: u64,
    /// Machine type reported by STIDP and STSI (e.g. 0x2964).
    pub cpu_type: u16,
    pub cpu_version: u8,
    /// 24-bit CPU identification number.
    pub cpu_serial: u32,
    pub manufacturer: String,
    pub model: String,
    pub plant: String,
    pub sequence: String,
    /// Name and number of the logical partition reported at STSI level 2.
    pub lpar_name: String,
    pub lpar_number: u16,
    pub tod: TodClockConfig,
    /// Bytes processed by one execution of MVCLE, CLCLE, SRST, CLST, MVST and CKSM before they
    /// end with condition code 3.
    pub cpu_determined_bytes: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            storage_size: 64 * STORAGE_INCREMENT,
            cpu_type: 0x2964,
            cpu_version: 0,
            cpu_serial: 0x01_0000,
            manufacturer: "ZARCH".to_string(),
            model: "EMU".to_string(),
            plant: "EMU".to_string(),
            sequence: "0000000000000001".to_string(),
            lpar_name: "ZARCH".to_string(),
            lpar_number: 1,
            tod: TodClockConfig::default(),
            cpu_determined_bytes: crate::interp::DEFAULT_CPU_DETERMINED_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cpus={0}; must be between 1 and {MAX_CPUS}")]
    InvalidCpuCount(u16),
    #[error("storage size {0:#x} is not a non-zero multiple of 1 MiB")]
    InvalidStorageSize(u64),
    #[error("cpu_serial {0:#x} does not fit in 24 bits")]
    InvalidSerial(u32),
    #[error("{field} {value:?} is longer than {max} characters")]
    IdentifierTooLong {
        field: &'static str,
        value: String,
        max: usize,
    },
    #[error("cpu_determined_bytes must be non-zero")]
    InvalidChunkSize,
    #[error("cpu address {0} is not part of the configuration")]
    NoSuchCpu(u16),
    #[error("cpu address {0} already has a vcpu")]
    CpuInUse(u16),
    #[error(transparent)]
    Storage(#[from] MemError),
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::InvalidCpuCount(self.cpus));
        }
        if self.storage_size == 0 || self.storage_size % STORAGE_INCREMENT != 0 {
            return Err(ConfigError::InvalidStorageSize(self.storage_size));
        }
        if self.cpu_serial > 0xff_ffff {
            return Err(ConfigError::InvalidSerial(self.cpu_serial));
        }
        let identifiers: [(&'static str, &str, usize); 5] = [
            ("manufacturer", &self.manufacturer, 16),
            ("model", &self.model, 16),
            ("plant", &self.plant, 4),
            ("sequence", &self.sequence, 16),
            ("lpar_name", &self.lpar_name, 8),
        ];
        for (field, value, max) in identifiers {
            if value.chars().count() > max {
                return Err(ConfigError::IdentifierTooLong {
                    field,
                    value: value.to_string(),
                    max,
                });
            }
        }
        if self.cpu_determined_bytes == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        Ok(())
    }
}

/// Services behind DIAGNOSE codes the machine does not implement itself.
pub trait Hypervisor: Send + Sync {
    /// Handles DIAGNOSE `code` issued by `cpu_addr` with the R1 and R3 register contents.
    ///
    /// Returns the value to place in R1, or `None` when the code is not supported (which the
    /// guest sees as a specification exception).
    fn diagnose(&self, cpu_addr: u16, code: u16, r1: u64, r3: u64) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Operating,
    CheckStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Cpu,
    Initial,
}

/// Requests posted to a CPU by other CPUs, applied by the target at an instruction boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingRequests {
    pub reset: Option<ResetKind>,
    pub set_prefix: Option<u64>,
    /// Store status at the architected save area (STOP AND STORE STATUS).
    pub store_status: bool,
    /// Store status at an absolute address (STORE STATUS AT ADDRESS).
    pub store_status_at: Option<u64>,
    pub restart: bool,
}

/// External interruption conditions waiting for the target to enable them.
#[derive(Debug, Clone, Default)]
struct PendingExternal {
    external_call: Option<u16>,
    emergency: BTreeSet<u16>,
    service_signal: Option<u32>,
}

/// An external interruption taken from a CPU's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalRequest {
    EmergencySignal { source: u16 },
    ExternalCall { source: u16 },
    ServiceSignal { param: u32 },
}

/// External-interruption subclasses the target currently accepts (CR0 subclass mask bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalMask {
    pub emergency_signal: bool,
    pub external_call: bool,
    pub service_signal: bool,
}

#[derive(Debug)]
struct CpuSlot {
    run: RunState,
    tlb: Arc<Mutex<Tlb>>,
    attention: Arc<AtomicBool>,
    requests: PendingRequests,
    external: PendingExternal,
    attached: bool,
}

impl CpuSlot {
    fn new(addr: u16) -> Self {
        Self {
            run: if addr == 0 {
                RunState::Operating
            } else {
                RunState::Stopped
            },
            tlb: Arc::new(Mutex::new(Tlb::new())),
            attention: Arc::new(AtomicBool::new(false)),
            requests: PendingRequests::default(),
            external: PendingExternal::default(),
            attached: false,
        }
    }

    fn notify(&self) {
        self.attention.store(true, Ordering::Release);
    }

    /// Whether a previously posted order that changes the CPU's state has not been applied yet.
    fn busy(&self) -> bool {
        self.requests != PendingRequests::default()
    }
}

struct Shared {
    tod: TodClock,
    cpus: Vec<CpuSlot>,
}

/// SIGP order codes.
pub mod sigp_order {
    pub const SENSE: u8 = 0x01;
    pub const EXTERNAL_CALL: u8 = 0x02;
    pub const EMERGENCY_SIGNAL: u8 = 0x03;
    pub const START: u8 = 0x04;
    pub const STOP: u8 = 0x05;
    pub const RESTART: u8 = 0x06;
    pub const STOP_AND_STORE_STATUS: u8 = 0x09;
    pub const INITIAL_CPU_RESET: u8 = 0x0b;
    pub const CPU_RESET: u8 = 0x0c;
    pub const SET_PREFIX: u8 = 0x0d;
    pub const STORE_STATUS_AT_ADDRESS: u8 = 0x0e;
    pub const SET_ARCHITECTURE: u8 = 0x12;
    pub const CONDITIONAL_EMERGENCY_SIGNAL: u8 = 0x13;
    pub const SENSE_RUNNING_STATUS: u8 = 0x15;
}

/// Status bits SIGP stores in R1 with condition code 1.
pub mod sigp_status {
    pub const EQUIPMENT_CHECK: u32 = 0x8000_0000;
    pub const NOT_RUNNING: u32 = 0x0000_0400;
    pub const INCORRECT_STATE: u32 = 0x0000_0200;
    pub const INVALID_PARAMETER: u32 = 0x0000_0100;
    pub const EXT_CALL_PENDING: u32 = 0x0000_0080;
    pub const STOPPED: u32 = 0x0000_0040;
    pub const OPERATOR_INTERVENING: u32 = 0x0000_0020;
    pub const CHECK_STOP: u32 = 0x0000_0010;
    pub const INOPERATIVE: u32 = 0x0000_0004;
    pub const INVALID_ORDER: u32 = 0x0000_0002;
    pub const RECEIVER_CHECK: u32 = 0x0000_0001;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigpResult {
    /// cc 0.
    Accepted,
    /// cc 1, status stored in R1.
    Status(u32),
    /// cc 2.
    Busy,
    /// cc 3.
    NotOperational,
}

impl SigpResult {
    pub const fn cc(self) -> u8 {
        match self {
            SigpResult::Accepted => 0,
            SigpResult::Status(_) => 1,
            SigpResult::Busy => 2,
            SigpResult::NotOperational => 3,
        }
    }
}

pub struct Machine {
    config: MachineConfig,
    ram: Arc<GuestRam>,
    clock: Arc<dyn HostClock>,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    shared: Mutex<Shared>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(StdHostClock::new()))
    }

    pub fn with_clock(config: MachineConfig, clock: Arc<dyn HostClock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let ram = Arc::new(GuestRam::new(config.storage_size)?);
        let shared = Shared {
            tod: TodClock::new(config.tod),
            cpus: (0..config.cpus).map(CpuSlot::new).collect(),
        };
        Ok(Self {
            config,
            ram,
            clock,
            hypervisor: None,
            shared: Mutex::new(shared),
        })
    }

    pub fn with_hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    #[inline]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[inline]
    pub fn ram(&self) -> &Arc<GuestRam> {
        &self.ram
    }

    #[inline]
    pub fn hypervisor(&self) -> Option<&Arc<dyn Hypervisor>> {
        self.hypervisor.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Guest time in nanoseconds.
    #[inline]
    pub fn guest_now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// STORE CLOCK value: unique across all CPUs of the configuration.
    pub fn tod_store(&self) -> u64 {
        let now = self.guest_now_ns();
        self.lock().tod.store(now)
    }

    pub fn tod_read(&self) -> u64 {
        let now = self.guest_now_ns();
        self.lock().tod.read(now)
    }

    pub fn tod_set(&self, value: u64) {
        let now = self.guest_now_ns();
        self.lock().tod.set(now, value);
    }

    /// Creates the execution context for CPU `addr`. CPU 0 starts operating, the others stopped.
    pub fn create_vcpu(self: &Arc<Self>, addr: u16) -> Result<Vcpu, ConfigError> {
        let (tlb, attention) = {
            let mut shared = self.lock();
            let slot = shared
                .cpus
                .get_mut(addr as usize)
                .ok_or(ConfigError::NoSuchCpu(addr))?;
            if slot.attached {
                return Err(ConfigError::CpuInUse(addr));
            }
            slot.attached = true;
            (Arc::clone(&slot.tlb), Arc::clone(&slot.attention))
        };
        let state = CpuState::with_attention(addr, attention);
        let bus = PagingBus::new(Arc::clone(&self.ram), tlb);
        Ok(Vcpu::new(state, bus, Arc::clone(self)))
    }

    pub(crate) fn detach_vcpu(&self, addr: u16) {
        if let Some(slot) = self.lock().cpus.get_mut(addr as usize) {
            slot.attached = false;
        }
    }

    pub fn run_state(&self, addr: u16) -> Option<RunState> {
        self.lock().cpus.get(addr as usize).map(|slot| slot.run)
    }

    /// Purges the TLB of every CPU in the configuration.
    pub fn purge_all_tlbs(&self) {
        let shared = self.lock();
        tracing::trace!(cpus = shared.cpus.len(), "broadcast TLB purge");
        for slot in &shared.cpus {
            slot.tlb
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .flush_all();
        }
    }

    /// Drops cached translations of the page containing `vaddr` on every CPU.
    pub fn invalidate_page_all(&self, vaddr: u64) {
        let shared = self.lock();
        tracing::trace!(vaddr, "broadcast page invalidation");
        for slot in &shared.cpus {
            slot.tlb
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .invalidate_page(vaddr);
        }
    }

    /// Makes a service-signal external interruption pending for `target`.
    pub fn post_service_signal(&self, target: u16, param: u32) {
        let mut shared = self.lock();
        if let Some(slot) = shared.cpus.get_mut(target as usize) {
            slot.external.service_signal = Some(param);
            slot.notify();
        }
    }

    /// Takes the state-changing requests posted to `addr` and clears its attention flag.
    ///
    /// External conditions stay queued until [`Machine::take_external`] finds them enabled.
    pub(crate) fn take_requests(&self, addr: u16) -> PendingRequests {
        let mut shared = self.lock();
        match shared.cpus.get_mut(addr as usize) {
            Some(slot) => {
                slot.attention.store(false, Ordering::Release);
                std::mem::take(&mut slot.requests)
            }
            None => PendingRequests::default(),
        }
    }

    /// Takes the highest-priority external request `addr` accepts under `mask`.
    pub(crate) fn take_external(&self, addr: u16, mask: ExternalMask) -> Option<ExternalRequest> {
        let mut shared = self.lock();
        let ext = &mut shared.cpus.get_mut(addr as usize)?.external;
        if mask.emergency_signal {
            if let Some(source) = ext.emergency.pop_first() {
                return Some(ExternalRequest::EmergencySignal { source });
            }
        }
        if mask.external_call {
            if let Some(source) = ext.external_call.take() {
                return Some(ExternalRequest::ExternalCall { source });
            }
        }
        if mask.service_signal {
            if let Some(param) = ext.service_signal.take() {
                return Some(ExternalRequest::ServiceSignal { param });
            }
        }
        None
    }

    /// Executes SIGP `order` from CPU `source` against CPU `target`.
    pub fn sigp(&self, source: u16, target: u16, order: u8, param: u64) -> SigpResult {
        use sigp_order::*;
        use sigp_status::*;

        let storage_size = self.ram.size();
        let mut shared = self.lock();
        let Some(slot) = shared
            .cpus
            .get_mut(target as usize)
            .filter(|slot| slot.attached)
        else {
            return SigpResult::NotOperational;
        };

        let state_changing = !matches!(
            order,
            SENSE
                | EXTERNAL_CALL
                | EMERGENCY_SIGNAL
                | CONDITIONAL_EMERGENCY_SIGNAL
                | SENSE_RUNNING_STATUS
                | SET_ARCHITECTURE
        );
        if state_changing && slot.busy() && source != target {
            return SigpResult::Busy;
        }

        let result = match order {
            SENSE => {
                let mut status = 0;
                match slot.run {
                    RunState::Stopped => status |= STOPPED,
                    RunState::CheckStop => status |= CHECK_STOP,
                    RunState::Operating => {}
                }
                if slot.external.external_call.is_some() {
                    status |= EXT_CALL_PENDING;
                }
                if status == 0 {
                    SigpResult::Accepted
                } else {
                    SigpResult::Status(status)
                }
            }
            EXTERNAL_CALL => {
                if slot.external.external_call.is_some() {
                    SigpResult::Status(EXT_CALL_PENDING)
                } else {
                    slot.external.external_call = Some(source);
                    slot.notify();
                    SigpResult::Accepted
                }
            }
            EMERGENCY_SIGNAL | CONDITIONAL_EMERGENCY_SIGNAL => {
                slot.external.emergency.insert(source);
                slot.notify();
                SigpResult::Accepted
            }
            START => {
                if slot.run == RunState::Stopped {
                    slot.run = RunState::Operating;
                    slot.notify();
                }
                SigpResult::Accepted
            }
            STOP => {
                slot.run = RunState::Stopped;
                slot.notify();
                SigpResult::Accepted
            }
            STOP_AND_STORE_STATUS => {
                slot.run = RunState::Stopped;
                slot.requests.store_status = true;
                slot.notify();
                SigpResult::Accepted
            }
            RESTART => {
                slot.run = RunState::Operating;
                slot.requests.restart = true;
                slot.notify();
                SigpResult::Accepted
            }
            INITIAL_CPU_RESET | CPU_RESET => {
                slot.run = RunState::Stopped;
                slot.requests.reset = Some(if order == INITIAL_CPU_RESET {
                    ResetKind::Initial
                } else {
                    ResetKind::Cpu
                });
                slot.notify();
                SigpResult::Accepted
            }
            SET_PREFIX => {
                let prefix = param & PREFIX_MASK;
                if slot.run != RunState::Stopped {
                    SigpResult::Status(INCORRECT_STATE)
                } else if prefix + PREFIX_AREA_SIZE > storage_size {
                    SigpResult::Status(INVALID_PARAMETER)
                } else {
                    slot.requests.set_prefix = Some(prefix);
                    slot.notify();
                    SigpResult::Accepted
                }
            }
            STORE_STATUS_AT_ADDRESS => {
                let area = param & 0x7fff_fe00;
                if slot.run != RunState::Stopped {
                    SigpResult::Status(INCORRECT_STATE)
                } else if area + 0x200 > storage_size {
                    SigpResult::Status(INVALID_PARAMETER)
                } else {
                    slot.requests.store_status_at = Some(area);
                    slot.notify();
                    SigpResult::Accepted
                }
            }
            SET_ARCHITECTURE => match param & 0xff {
                // Only z/Architecture mode exists; switching into it is a no-op.
                1 | 2 => SigpResult::Accepted,
                _ => SigpResult::Status(INVALID_PARAMETER),
            },
            SENSE_RUNNING_STATUS => {
                if slot.run == RunState::Operating {
                    SigpResult::Accepted
                } else {
                    SigpResult::Status(NOT_RUNNING)
                }
            }
            _ => {
                tracing::debug!(source, target, order, "unsupported SIGP order");
                SigpResult::Status(INVALID_ORDER)
            }
        };
        tracing::trace!(source, target, order, ?result, "sigp");
        result
    }
}
