use zarch_mem::{real_to_absolute, StorageKey, PAGE_SIZE};

use crate::exception::Exception;
use crate::state::CpuState;

/// Which address space a logical address is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Whatever the PSW address-space control selects (real when DAT is off).
    Current,
    Primary,
    Secondary,
    Home,
    /// Real address: prefixing applies, DAT does not.
    Real,
    Absolute,
}

/// The memory collaborator seen by helpers.
///
/// Implementations resolve logical addresses (translation, DAT protection, prefixing, key
/// controlled protection) in [`CpuBus::translate_keyed`]; everything else is expressed on
/// absolute addresses. The provided accessors are big-endian and split accesses at page
/// boundaries so each page is translated separately.
pub trait CpuBus {
    /// Picks up the translation context (control registers, PSW, prefix) of `state`.
    fn sync(&mut self, state: &CpuState);

    /// PSW key captured by the last [`CpuBus::sync`].
    fn access_key(&self) -> u8;

    /// Resolves one byte's logical address to an absolute address, checking access rights for
    /// an access with `key`.
    fn translate_keyed(
        &mut self,
        vaddr: u64,
        space: Space,
        write: bool,
        key: u8,
    ) -> Result<u64, Exception>;

    /// Translates through the tables of `space` without access checks, returning the real
    /// address and whether the page is DAT protected.
    fn translate_real(&mut self, vaddr: u64, space: Space) -> Result<(u64, bool), Exception>;

    fn read_abs(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Exception>;
    fn write_abs(&mut self, addr: u64, buf: &[u8]) -> Result<(), Exception>;

    /// Compare-and-swap on absolute storage; returns the previous contents.
    fn cmpxchg_abs_u32(&mut self, addr: u64, expected: u32, new: u32) -> Result<u32, Exception>;
    fn cmpxchg_abs_u64(&mut self, addr: u64, expected: u64, new: u64) -> Result<u64, Exception>;
    fn cmpxchg_abs_u128(
        &mut self,
        addr: u64,
        expected: u128,
        new: u128,
    ) -> Result<u128, Exception>;

    fn storage_key(&mut self, abs: u64) -> Result<StorageKey, Exception>;
    fn set_storage_key(&mut self, abs: u64, key: StorageKey) -> Result<(), Exception>;
    /// Clears the reference bit and returns the key as it was.
    fn reset_reference(&mut self, abs: u64) -> Result<StorageKey, Exception>;

    /// Size of main storage in bytes.
    fn memory_size(&self) -> u64;

    /// Drops this CPU's cached translations.
    fn purge_tlb(&mut self);

    /// Drops this CPU's cached translations for one page.
    fn purge_tlb_page(&mut self, vaddr: u64) {
        let _ = vaddr;
        self.purge_tlb();
    }

    fn translate(&mut self, vaddr: u64, space: Space, write: bool) -> Result<u64, Exception> {
        let key = self.access_key();
        self.translate_keyed(vaddr, space, write, key)
    }

    fn read_bytes_keyed(
        &mut self,
        vaddr: u64,
        space: Space,
        key: u8,
        buf: &mut [u8],
    ) -> Result<(), Exception> {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr.wrapping_add(done as u64);
            let chunk = chunk_len(addr, buf.len() - done);
            let abs = self.translate_keyed(addr, space, false, key)?;
            self.read_abs(abs, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    fn write_bytes_keyed(
        &mut self,
        vaddr: u64,
        space: Space,
        key: u8,
        buf: &[u8],
    ) -> Result<(), Exception> {
        // Translate every page first so a fault leaves storage untouched.
        let mut targets = Vec::with_capacity(2);
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr.wrapping_add(done as u64);
            let chunk = chunk_len(addr, buf.len() - done);
            targets.push((self.translate_keyed(addr, space, true, key)?, done, chunk));
            done += chunk;
        }
        for (abs, start, len) in targets {
            self.write_abs(abs, &buf[start..start + len])?;
        }
        Ok(())
    }

    fn read_bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), Exception> {
        let key = self.access_key();
        self.read_bytes_keyed(vaddr, Space::Current, key, buf)
    }

    fn write_bytes(&mut self, vaddr: u64, buf: &[u8]) -> Result<(), Exception> {
        let key = self.access_key();
        self.write_bytes_keyed(vaddr, Space::Current, key, buf)
    }

    fn read_u8(&mut self, vaddr: u64) -> Result<u8, Exception> {
        let mut buf = [0u8; 1];
        self.read_bytes(vaddr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self, vaddr: u64) -> Result<u16, Exception> {
        let mut buf = [0u8; 2];
        self.read_bytes(vaddr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&mut self, vaddr: u64) -> Result<u32, Exception> {
        let mut buf = [0u8; 4];
        self.read_bytes(vaddr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self, vaddr: u64) -> Result<u64, Exception> {
        let mut buf = [0u8; 8];
        self.read_bytes(vaddr, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_u128(&mut self, vaddr: u64) -> Result<u128, Exception> {
        let mut buf = [0u8; 16];
        self.read_bytes(vaddr, &mut buf)?;
        Ok(u128::from_be_bytes(buf))
    }

    fn write_u8(&mut self, vaddr: u64, val: u8) -> Result<(), Exception> {
        self.write_bytes(vaddr, &[val])
    }

    fn write_u16(&mut self, vaddr: u64, val: u16) -> Result<(), Exception> {
        self.write_bytes(vaddr, &val.to_be_bytes())
    }

    fn write_u32(&mut self, vaddr: u64, val: u32) -> Result<(), Exception> {
        self.write_bytes(vaddr, &val.to_be_bytes())
    }

    fn write_u64(&mut self, vaddr: u64, val: u64) -> Result<(), Exception> {
        self.write_bytes(vaddr, &val.to_be_bytes())
    }

    fn write_u128(&mut self, vaddr: u64, val: u128) -> Result<(), Exception> {
        self.write_bytes(vaddr, &val.to_be_bytes())
    }

    /// Real-address accessors used for the lowcore and by the real-address instructions.
    fn read_real_u32(&mut self, real: u64) -> Result<u32, Exception> {
        let mut buf = [0u8; 4];
        self.read_bytes_keyed(real, Space::Real, 0, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_real_u64(&mut self, real: u64) -> Result<u64, Exception> {
        let mut buf = [0u8; 8];
        self.read_bytes_keyed(real, Space::Real, 0, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn write_real(&mut self, real: u64, buf: &[u8]) -> Result<(), Exception> {
        self.write_bytes_keyed(real, Space::Real, 0, buf)
    }

    fn write_real_u16(&mut self, real: u64, val: u16) -> Result<(), Exception> {
        self.write_real(real, &val.to_be_bytes())
    }

    fn write_real_u32(&mut self, real: u64, val: u32) -> Result<(), Exception> {
        self.write_real(real, &val.to_be_bytes())
    }

    fn write_real_u64(&mut self, real: u64, val: u64) -> Result<(), Exception> {
        self.write_real(real, &val.to_be_bytes())
    }
}

#[inline]
fn chunk_len(addr: u64, remaining: usize) -> usize {
    let to_page_end = (PAGE_SIZE - (addr % PAGE_SIZE)) as usize;
    remaining.min(to_page_end)
}

/// Identity-mapped memory bus used by unit tests.
///
/// Logical addresses are real addresses in every space; prefixing and storage keys are still
/// honoured so lowcore and key tests behave like the real bus.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    keys: Vec<u8>,
    prefix: u64,
    key: u8,
    /// Number of local TLB purges, for tests that check purge broadcasts.
    pub purges: u32,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        let frames = size.div_ceil(PAGE_SIZE as usize);
        Self {
            mem: vec![0; size],
            keys: vec![0; frames],
            prefix: 0,
            key: 0,
            purges: 0,
        }
    }

    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        let end = start + len;
        &self.mem[start..end]
    }

    fn check(&self, addr: u64, len: usize) -> Result<usize, Exception> {
        let start = usize::try_from(addr).map_err(|_| Exception::Addressing { addr })?;
        match start.checked_add(len) {
            Some(end) if end <= self.mem.len() => Ok(start),
            _ => Err(Exception::Addressing {
                addr: addr.max(self.mem.len() as u64),
            }),
        }
    }

    fn frame(&self, addr: u64) -> Result<usize, Exception> {
        self.check(addr, 1)?;
        Ok((addr / PAGE_SIZE) as usize)
    }

    fn record(&mut self, addr: u64, len: usize, write: bool) {
        if len == 0 {
            return;
        }
        let bits = if write {
            StorageKey::REFERENCE | StorageKey::CHANGE
        } else {
            StorageKey::REFERENCE
        };
        let first = (addr / PAGE_SIZE) as usize;
        let last = ((addr + len as u64 - 1) / PAGE_SIZE) as usize;
        for k in &mut self.keys[first..=last] {
            *k |= bits;
        }
    }
}

impl CpuBus for FlatTestBus {
    fn sync(&mut self, state: &CpuState) {
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
            _ => real_to_absolute(vaddr, self.prefix),
        };
        let frame = self.frame(abs)?;
        if !StorageKey(self.keys[frame]).permits(key, write) {
            return Err(Exception::Protection { addr: vaddr });
        }
        Ok(abs)
    }

    fn translate_real(&mut self, vaddr: u64, _space: Space) -> Result<(u64, bool), Exception> {
        Ok((vaddr, false))
    }

    fn read_abs(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Exception> {
        let start = self.check(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[start..start + buf.len()]);
        self.record(addr, buf.len(), false);
        Ok(())
    }

    fn write_abs(&mut self, addr: u64, buf: &[u8]) -> Result<(), Exception> {
        let start = self.check(addr, buf.len())?;
        self.mem[start..start + buf.len()].copy_from_slice(buf);
        self.record(addr, buf.len(), true);
        Ok(())
    }

    fn cmpxchg_abs_u32(&mut self, addr: u64, expected: u32, new: u32) -> Result<u32, Exception> {
        let mut old = [0u8; 4];
        self.read_abs(addr, &mut old)?;
        let old = u32::from_be_bytes(old);
        if old == expected {
            self.write_abs(addr, &new.to_be_bytes())?;
        }
        Ok(old)
    }

    fn cmpxchg_abs_u64(&mut self, addr: u64, expected: u64, new: u64) -> Result<u64, Exception> {
        let mut old = [0u8; 8];
        self.read_abs(addr, &mut old)?;
        let old = u64::from_be_bytes(old);
        if old == expected {
            self.write_abs(addr, &new.to_be_bytes())?;
        }
        Ok(old)
    }

    fn cmpxchg_abs_u128(
        &mut self,
        addr: u64,
        expected: u128,
        new: u128,
    ) -> Result<u128, Exception> {
        let mut old = [0u8; 16];
        self.read_abs(addr, &mut old)?;
        let old = u128::from_be_bytes(old);
        if old == expected {
            self.write_abs(addr, &new.to_be_bytes())?;
        }
        Ok(old)
    }

    fn storage_key(&mut self, abs: u64) -> Result<StorageKey, Exception> {
        Ok(StorageKey(self.keys[self.frame(abs)?]))
    }

    fn set_storage_key(&mut self, abs: u64, key: StorageKey) -> Result<(), Exception> {
        let frame = self.frame(abs)?;
        self.keys[frame] = key.0 & 0xfe;
        Ok(())
    }

    fn reset_reference(&mut self, abs: u64) -> Result<StorageKey, Exception> {
        let frame = self.frame(abs)?;
        let old = self.keys[frame];
        self.keys[frame] = old & !StorageKey::REFERENCE;
        Ok(StorageKey(old))
    }

    fn memory_size(&self) -> u64 {
        self.mem.len() as u64
    }

    fn purge_tlb(&mut self) {
        self.purges += 1;
    }
}
