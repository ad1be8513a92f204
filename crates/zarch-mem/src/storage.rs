use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("storage access out of range: addr=0x{addr:x} len={len} size=0x{size:x}")]
    OutOfRange { addr: u64, len: u64, size: u64 },

    #[error("storage-key protection violation at 0x{addr:x}")]
    Protection { addr: u64 },

    #[error("storage size {size:#x} is not a non-zero multiple of the page size")]
    InvalidSize { size: u64 },
}

/// A storage key as kept per 4 KiB frame: access-control bits, fetch protection, reference and
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageKey(pub u8);

impl StorageKey {
    pub const ACC_MASK: u8 = 0xf0;
    pub const FETCH: u8 = 0x08;
    pub const REFERENCE: u8 = 0x04;
    pub const CHANGE: u8 = 0x02;

    #[inline]
    pub fn acc(self) -> u8 {
        self.0 >> 4
    }

    #[inline]
    pub fn fetch_protected(self) -> bool {
        self.0 & Self::FETCH != 0
    }

    #[inline]
    pub fn referenced(self) -> bool {
        self.0 & Self::REFERENCE != 0
    }

    #[inline]
    pub fn changed(self) -> bool {
        self.0 & Self::CHANGE != 0
    }

    /// Whether an access with `access_key` is permitted.
    ///
    /// Key zero matches everything; fetches are only checked when the frame is fetch protected.
    pub fn permits(self, access_key: u8, write: bool) -> bool {
        if access_key == 0 || access_key == self.acc() {
            return true;
        }
        !write && !self.fetch_protected()
    }
}

/// Shared main storage of a configuration, addressed with absolute addresses.
#[derive(Debug)]
pub struct GuestRam {
    size: u64,
    bytes: RwLock<Vec<u8>>,
    keys: Vec<AtomicU8>,
}

impl GuestRam {
    pub fn new(size: u64) -> Result<Self, MemError> {
        if size == 0 || size % PAGE_SIZE != 0 || usize::try_from(size).is_err() {
            return Err(MemError::InvalidSize { size });
        }
        let frames = (size / PAGE_SIZE) as usize;
        Ok(Self {
            size,
            bytes: RwLock::new(vec![0; size as usize]),
            keys: (0..frames).map(|_| AtomicU8::new(0)).collect(),
        })
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, addr: u64, len: u64) -> Result<(), MemError> {
        let end = addr.checked_add(len).ok_or(MemError::OutOfRange {
            addr,
            len,
            size: self.size,
        })?;
        if end > self.size {
            return Err(MemError::OutOfRange {
                addr,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemError> {
        self.check_range(addr, dst.len() as u64)?;
        let start = addr as usize;
        dst.copy_from_slice(&self.read_guard()[start..start + dst.len()]);
        self.record(addr, dst.len() as u64, false);
        Ok(())
    }

    pub fn write(&self, addr: u64, src: &[u8]) -> Result<(), MemError> {
        self.check_range(addr, src.len() as u64)?;
        let start = addr as usize;
        self.write_guard()[start..start + src.len()].copy_from_slice(src);
        self.record(addr, src.len() as u64, true);
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u32_be(&self, addr: u64) -> Result<u32, MemError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_u64_be(&self, addr: u64) -> Result<u64, MemError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemError> {
        self.write(addr, &[value])
    }

    pub fn write_u32_be(&self, addr: u64, value: u32) -> Result<(), MemError> {
        self.write(addr, &value.to_be_bytes())
    }

    pub fn write_u64_be(&self, addr: u64, value: u64) -> Result<(), MemError> {
        self.write(addr, &value.to_be_bytes())
    }

    /// Compare-and-swap on `N` bytes held under the exclusive storage lock.
    ///
    /// Returns the previous contents; the store happens only when they equal `expected`.
    fn cmpxchg_bytes<const N: usize>(
        &self,
        addr: u64,
        expected: [u8; N],
        new: [u8; N],
    ) -> Result<[u8; N], MemError> {
        self.check_range(addr, N as u64)?;
        let start = addr as usize;
        let mut guard = self.write_guard();
        let slot = &mut guard[start..start + N];
        let mut old = [0u8; N];
        old.copy_from_slice(slot);
        let swapped = old == expected;
        if swapped {
            slot.copy_from_slice(&new);
        }
        drop(guard);
        self.record(addr, N as u64, swapped);
        Ok(old)
    }

    pub fn cmpxchg_u32_be(&self, addr: u64, expected: u32, new: u32) -> Result<u32, MemError> {
        self.cmpxchg_bytes(addr, expected.to_be_bytes(), new.to_be_bytes())
            .map(u32::from_be_bytes)
    }

    pub fn cmpxchg_u64_be(&self, addr: u64, expected: u64, new: u64) -> Result<u64, MemError> {
        self.cmpxchg_bytes(addr, expected.to_be_bytes(), new.to_be_bytes())
            .map(u64::from_be_bytes)
    }

    pub fn cmpxchg_u128_be(&self, addr: u64, expected: u128, new: u128) -> Result<u128, MemError> {
        self.cmpxchg_bytes(addr, expected.to_be_bytes(), new.to_be_bytes())
            .map(u128::from_be_bytes)
    }

    fn frame(&self, addr: u64) -> Result<&AtomicU8, MemError> {
        self.check_range(addr, 1)?;
        Ok(&self.keys[(addr / PAGE_SIZE) as usize])
    }

    fn record(&self, addr: u64, len: u64, write: bool) {
        if len == 0 {
            return;
        }
        let bits = if write {
            StorageKey::REFERENCE | StorageKey::CHANGE
        } else {
            StorageKey::REFERENCE
        };
        let first = addr / PAGE_SIZE;
        let last = (addr + len - 1) / PAGE_SIZE;
        for frame in first..=last {
            self.keys[frame as usize].fetch_or(bits, Ordering::Relaxed);
        }
    }

    pub fn key(&self, addr: u64) -> Result<StorageKey, MemError> {
        Ok(StorageKey(self.frame(addr)?.load(Ordering::Acquire)))
    }

    /// SET STORAGE KEY: replaces the whole key byte (the low bit is not part of the key).
    pub fn set_key(&self, addr: u64, key: StorageKey) -> Result<(), MemError> {
        self.frame(addr)?.store(key.0 & 0xfe, Ordering::Release);
        Ok(())
    }

    /// RESET REFERENCE BIT: clears R and returns the key as it was before.
    pub fn reset_reference(&self, addr: u64) -> Result<StorageKey, MemError> {
        let old = self
            .frame(addr)?
            .fetch_and(!StorageKey::REFERENCE, Ordering::AcqRel);
        Ok(StorageKey(old))
    }

    /// Checks every frame touched by `addr..addr+len` against `access_key`.
    pub fn check_key(
        &self,
        addr: u64,
        len: u64,
        access_key: u8,
        write: bool,
    ) -> Result<(), MemError> {
        if access_key == 0 || len == 0 {
            return Ok(());
        }
        self.check_range(addr, len)?;
        let first = addr / PAGE_SIZE;
        let last = (addr + len - 1) / PAGE_SIZE;
        for frame in first..=last {
            let key = StorageKey(self.keys[frame as usize].load(Ordering::Acquire));
            if !key.permits(access_key, write) {
                let faulting = (frame * PAGE_SIZE).max(addr);
                return Err(MemError::Protection { addr: faulting });
            }
        }
        Ok(())
    }
}
