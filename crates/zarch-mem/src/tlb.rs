use crate::{Translation, PAGE_MASK};

const ENTRIES: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbEntry {
    asce: u64,
    vpage: u64,
    rpage: u64,
    protected: bool,
    valid: bool,
}

/// Direct-mapped translation lookaside buffer for one CPU.
///
/// Entries are tagged with the address-space-control element they were produced under, so
/// switching address spaces does not require a flush.
#[derive(Debug, Clone)]
pub struct Tlb {
    entries: Box<[TlbEntry; ENTRIES]>,
    hits: u64,
    misses: u64,
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: Box::new([TlbEntry::default(); ENTRIES]),
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    fn slot(vaddr: u64) -> usize {
        ((vaddr >> 12) as usize) & (ENTRIES - 1)
    }

    pub fn lookup(&mut self, asce: u64, vaddr: u64) -> Option<Translation> {
        let entry = &self.entries[Self::slot(vaddr)];
        if entry.valid && entry.asce == asce && entry.vpage == vaddr & PAGE_MASK {
            self.hits += 1;
            return Some(Translation {
                real: entry.rpage | (vaddr & !PAGE_MASK),
                protected: entry.protected,
            });
        }
        self.misses += 1;
        None
    }

    pub fn insert(&mut self, asce: u64, vaddr: u64, translation: Translation) {
        self.entries[Self::slot(vaddr)] = TlbEntry {
            asce,
            vpage: vaddr & PAGE_MASK,
            rpage: translation.real & PAGE_MASK,
            protected: translation.protected,
            valid: true,
        };
    }

    /// Drops the entry for `vaddr` in every address space.
    pub fn invalidate_page(&mut self, vaddr: u64) {
        let entry = &mut self.entries[Self::slot(vaddr)];
        if entry.vpage == vaddr & PAGE_MASK {
            entry.valid = false;
        }
    }

    pub fn flush_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.valid = false;
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(real: u64) -> Translation {
        Translation {
            real,
            protected: false,
        }
    }

    #[test]
    fn hit_after_insert_is_tagged_by_asce() {
        let mut tlb = Tlb::new();
        assert!(tlb.lookup(0x4000, 0x1234).is_none());
        tlb.insert(0x4000, 0x1234, t(0x20234));
        assert_eq!(tlb.lookup(0x4000, 0x1ffc).unwrap().real, 0x20ffc);
        assert!(tlb.lookup(0x5000, 0x1234).is_none());
        assert_eq!(tlb.stats(), (1, 2));
    }

    #[test]
    fn invalidate_and_flush() {
        let mut tlb = Tlb::new();
        tlb.insert(0x4000, 0x1000, t(0x20000));
        tlb.insert(0x4000, 0x2000, t(0x21000));
        tlb.invalidate_page(0x1000);
        assert!(tlb.lookup(0x4000, 0x1000).is_none());
        assert!(tlb.lookup(0x4000, 0x2000).is_some());
        tlb.flush_all();
        assert!(tlb.lookup(0x4000, 0x2000).is_none());
    }
}
