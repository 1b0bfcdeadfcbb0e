//! Executable memory for generated code.
//!
//! One anonymous mapping holds every function a [`crate::Rewriter`] produces. The mapping
//! flips between writable (while the encoder appends) and executable (while rewritten
//! functions may run); `mprotect` keeps the base address stable across flips, so code
//! addresses handed out earlier stay valid.

use memmap2::{Mmap, MmapMut};

use crate::{Error, Result};

/// Alignment of each committed function's first byte.
const FUNCTION_ALIGN: usize = 16;

enum Memory {
    Writable(MmapMut),
    Executable(Mmap),
    /// Transient state while flipping protection; never observable from outside.
    Empty,
}

impl Memory {
    fn base(&self) -> u64 {
        match self {
            Memory::Writable(m) => m.as_ptr() as u64,
            Memory::Executable(m) => m.as_ptr() as u64,
            Memory::Empty => 0,
        }
    }

    fn len(&self) -> usize {
        match self {
            Memory::Writable(m) => m.len(),
            Memory::Executable(m) => m.len(),
            Memory::Empty => 0,
        }
    }
}

/// A bump allocator over one executable mapping.
pub struct CodeStorage {
    memory: Memory,
    used: usize,
}

impl CodeStorage {
    /// Maps `capacity` bytes of anonymous writable memory.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the mapping cannot be created.
    pub fn new(capacity: usize) -> Result<CodeStorage> {
        Ok(CodeStorage {
            memory: Memory::Writable(MmapMut::map_anon(capacity)?),
            used: 0,
        })
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Bytes committed so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// The address the next committed function will start at.
    #[must_use]
    pub fn next_address(&self) -> u64 {
        self.memory.base() + self.aligned_used() as u64
    }

    fn aligned_used(&self) -> usize {
        self.used.next_multiple_of(FUNCTION_ALIGN)
    }

    /// Appends encoded code and returns its load address, which equals the
    /// [`CodeStorage::next_address`] observed before the call.
    ///
    /// The mapping is made writable if a previous rewrite left it executable.
    ///
    /// # Errors
    /// Returns [`Error::StorageExhausted`] when the code does not fit, or [`Error::Io`]
    /// if the protection change fails.
    pub fn commit(&mut self, code: &[u8]) -> Result<u64> {
        let start = self.aligned_used();
        let available = self.capacity().saturating_sub(start);
        if code.len() > available {
            return Err(Error::StorageExhausted {
                requested: code.len(),
                available,
            });
        }
        self.make_writable()?;
        let Memory::Writable(map) = &mut self.memory else {
            // make_writable only leaves the mapping in the writable state.
            return Err(Error::Encode("code storage lost its mapping".into()));
        };
        map[start..start + code.len()].copy_from_slice(code);
        self.used = start + code.len();
        Ok(map.as_ptr() as u64 + start as u64)
    }

    /// Makes the mapping executable (and read-only).
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the protection change fails.
    pub fn make_executable(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.memory, Memory::Empty) {
            Memory::Writable(map) => self.memory = Memory::Executable(map.make_exec()?),
            other => self.memory = other,
        }
        Ok(())
    }

    /// Makes the mapping writable (and non-executable).
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the protection change fails.
    pub fn make_writable(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.memory, Memory::Empty) {
            Memory::Executable(map) => self.memory = Memory::Writable(map.make_mut()?),
            other => self.memory = other,
        }
        Ok(())
    }

    /// Discards all committed code. Previously returned addresses become dangling.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

impl std::fmt::Debug for CodeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeStorage")
            .field("base", &format_args!("{:#x}", self.memory.base()))
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_returns_aligned_addresses() {
        let mut storage = CodeStorage::new(4096).unwrap();
        let first = storage.commit(&[0xc3]).unwrap();
        let second = storage.commit(&[0x90, 0xc3]).unwrap();
        assert_eq!(first % FUNCTION_ALIGN as u64, 0);
        assert_eq!(second, first + FUNCTION_ALIGN as u64);
        assert_eq!(storage.used(), FUNCTION_ALIGN + 2);
    }

    #[test]
    fn next_address_matches_commit() {
        let mut storage = CodeStorage::new(4096).unwrap();
        storage.commit(&[0x90; 3]).unwrap();
        let predicted = storage.next_address();
        let actual = storage.commit(&[0xc3]).unwrap();
        assert_eq!(predicted, actual);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut storage = CodeStorage::new(4096).unwrap();
        let err = storage.commit(&[0u8; 8192]).unwrap_err();
        assert!(matches!(
            err,
            Error::StorageExhausted {
                requested: 8192,
                available: 4096
            }
        ));
    }

    #[test]
    fn protection_flips_keep_the_base_address() {
        let mut storage = CodeStorage::new(4096).unwrap();
        let addr = storage.commit(&[0xc3]).unwrap();
        storage.make_executable().unwrap();
        assert_eq!(storage.next_address() & !0xfff, addr & !0xfff);
        storage.make_writable().unwrap();
        let next = storage.commit(&[0xc3]).unwrap();
        assert_eq!(next, addr + FUNCTION_ALIGN as u64);
    }

    #[test]
    fn redundant_protection_flips_keep_the_mapping() {
        let mut storage = CodeStorage::new(4096).unwrap();
        // Already writable; the flip must be a no-op, not a teardown.
        storage.make_writable().unwrap();
        let addr = storage.commit(&[0xc3]).unwrap();
        storage.make_executable().unwrap();
        storage.make_executable().unwrap();
        assert_eq!(storage.next_address() & !0xfff, addr & !0xfff);
        storage.make_writable().unwrap();
        assert_eq!(storage.commit(&[0xc3]).unwrap(), addr + FUNCTION_ALIGN as u64);
    }

    #[test]
    fn reset_rewinds_the_allocator() {
        let mut storage = CodeStorage::new(4096).unwrap();
        let first = storage.commit(&[0xc3]).unwrap();
        storage.reset();
        assert_eq!(storage.used(), 0);
        assert_eq!(storage.commit(&[0xc3]).unwrap(), first);
    }
}
