use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use zarch_mem::{dat, real_to_absolute, GuestRam, StorageKey, Tlb, Translation};

use crate::exception::Exception;
use crate::mem::{CpuBus, Space};
use crate::state::{AddressSpace, CpuState};

/// A translating [`CpuBus`] over shared guest storage.
///
/// Each CPU owns one `PagingBus`. The TLB is behind an `Arc<Mutex<_>>` so the machine can purge
/// it on behalf of other CPUs (COMPARE AND SWAP AND PURGE, IPTE).
#[derive(Debug, Clone)]
pub struct PagingBus {
    ram: Arc<GuestRam>,
    tlb: Arc<Mutex<Tlb>>,
    dat: bool,
    space: AddressSpace,
    primary_asce: u64,
    secondary_asce: u64,
    home_asce: u64,
    prefix: u64,
    key: u8,
}

impl PagingBus {
    pub fn new(ram: Arc<GuestRam>, tlb: Arc<Mutex<Tlb>>) -> Self {
        Self {
            ram,
            tlb,
            dat: false,
            space: AddressSpace::Primary,
            primary_asce: 0,
            secondary_asce: 0,
            home_asce: 0,
            prefix: 0,
            key: 0,
        }
    }

    #[inline]
    pub fn ram(&self) -> &Arc<GuestRam> {
        &self.ram
    }

    #[inline]
    pub fn tlb(&self) -> &Arc<Mutex<Tlb>> {
        &self.tlb
    }

    fn lock_tlb(&self) -> MutexGuard<'_, Tlb> {
        self.tlb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn asce_for(&self, space: Space) -> Option<u64> {
        let space = match space {
            Space::Current => self.space,
            Space::Primary => AddressSpace::Primary,
            Space::Secondary => AddressSpace::Secondary,
            Space::Home => AddressSpace::Home,
            Space::Real | Space::Absolute => return None,
        };
        Some(match space {
            AddressSpace::Primary | AddressSpace::AccessRegister => self.primary_asce,
            AddressSpace::Secondary => self.secondary_asce,
            AddressSpace::Home => self.home_asce,
        })
    }

    fn walk(&self, asce: u64, vaddr: u64) -> Result<Translation, Exception> {
        if let Some(hit) = self.lock_tlb().lookup(asce, vaddr) {
            return Ok(hit);
        }
        let t = dat::translate(&self.ram, asce, vaddr).map_err(|f| Exception::from_dat(f, vaddr))?;
        self.lock_tlb().insert(asce, vaddr, t);
        Ok(t)
    }
}

impl CpuBus for PagingBus {
    fn sync(&mut self, state: &CpuState) {
        self.dat = state.dat_enabled();
        self.space = state.address_space();
        self.primary_asce = state.asce(AddressSpace::Primary);
        self.secondary_asce = state.asce(AddressSpace::Secondary);
        self.home_asce = state.asce(AddressSpace::Home);
        self.prefix = state.prefix;
        self.key = state.psw_key();
    }

    fn access_key(&self) -> u8 {
        self.key
    }

    fn translate_keyed(
        &mut self,
        vaddr: u64,
        space: Space,
        write: bool,
        key: u8,
    ) -> Result<u64, Exception> {
        let abs = match space {
            Space::Absolute => vaddr,
            Space::Real => real_to_absolute(vaddr, self.prefix),
            _ if !self.dat => real_to_absolute(vaddr, self.prefix),
            _ => {
                let (real, protected) = self.translate_real(vaddr, space)?;
                if write && protected {
                    return Err(Exception::Protection { addr: vaddr });
                }
                real_to_absolute(real, self.prefix)
            }
        };
        if abs >= self.ram.size() {
            return Err(Exception::Addressing { addr: abs });
        }
        self.ram
            .check_key(abs, 1, key, write)
            .map_err(|_| Exception::Protection { addr: vaddr })?;
        Ok(abs)
    }

    fn translate_real(&mut self, vaddr: u64, space: Space) -> Result<(u64, bool), Exception> {
        match self.asce_for(space) {
            Some(asce) if self.dat || space != Space::Current => {
                let t = self.walk(asce, vaddr)?;
                Ok((t.real, t.protected))
            }
            _ => Ok((vaddr, false)),
        }
    }

    fn read_abs(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Exception> {
        Ok(self.ram.read(addr, buf)?)
    }

    fn write_abs(&mut self, addr: u64, buf: &[u8]) -> Result<(), Exception> {
        Ok(self.ram.write(addr, buf)?)
    }

    fn cmpxchg_abs_u32(&mut self, addr: u64, expected: u32, new: u32) -> Result<u32, Exception> {
        Ok(self.ram.cmpxchg_u32_be(addr, expected, new)?)
    }

    fn cmpxchg_abs_u64(&mut self, addr: u64, expected: u64, new: u64) -> Result<u64, Exception> {
        Ok(self.ram.cmpxchg_u64_be(addr, expected, new)?)
    }

    fn cmpxchg_abs_u128(
        &mut self,
        addr: u64,
        expected: u128,
        new: u128,
    ) -> Result<u128, Exception> {
        Ok(self.ram.cmpxchg_u128_be(addr, expected, new)?)
    }

    fn storage_key(&mut self, abs: u64) -> Result<StorageKey, Exception> {
        Ok(self.ram.key(abs)?)
    }

    fn set_storage_key(&mut self, abs: u64, key: StorageKey) -> Result<(), Exception> {
        Ok(self.ram.set_key(abs, key)?)
    }

    fn reset_reference(&mut self, abs: u64) -> Result<StorageKey, Exception> {
        Ok(self.ram.reset_reference(abs)?)
    }

    fn memory_size(&self) -> u64 {
        self.ram.size()
    }

    fn purge_tlb(&mut self) {
        self.lock_tlb().flush_all();
    }

    fn purge_tlb_page(&mut self, vaddr: u64) {
        self.lock_tlb().invalidate_page(vaddr);
    }
}
