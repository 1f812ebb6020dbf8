//! Segment table and word/string-level memory access

use std::collections::BTreeMap;

use crate::arith::{bytes_to_word, range_collide, to_u32, word_to_bytes};
use crate::consts::Word;
use crate::error::EngineError;
use crate::segment::{Permission, Segment};

/// Owns every mapped [`Segment`] and routes address-based access to the
/// segment that claims it.
///
/// Segments are kept in a `BTreeMap` keyed by name rather than a `Vec`, so
/// `unmap` and "does this name already exist" are both direct lookups
/// instead of linear scans; iteration order (used only by `find_by_addr`)
/// doesn't need to match insertion order for this engine's fixed layout.
#[derive(Debug, Default)]
pub struct MemoryManager {
    segments: BTreeMap<String, Segment>,
}

impl MemoryManager {
    /// An empty memory manager with no mapped segments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a new segment. Fails with [`EngineError::AllocFail`] if the new
    /// range collides with any existing segment.
    pub fn map(
        &mut self,
        name: impl Into<String>,
        start: Word,
        size: Word,
        permission: Permission,
        init_data: &[u8],
    ) -> crate::error::Result<()> {
        let name = name.into();
        let end = start.saturating_add(size);

        for seg in self.segments.values() {
            if range_collide(start, end, seg.start(), seg.end()) {
                return Err(EngineError::alloc_fail(format!(
                    "segment {name} at [{start:#x}, {end:#x}) collides with {}",
                    seg.name()
                )));
            }
        }

        self.segments.insert(name.clone(), Segment::new(name, start, size, permission, init_data));
        Ok(())
    }

    /// Unmap the segment owning `addr`.
    pub fn unmap_addr(&mut self, addr: Word) -> crate::error::Result<()> {
        let name = self.find_by_addr(addr)?.name().to_string();
        self.segments.remove(&name);
        Ok(())
    }

    /// Unmap the segment named `name`.
    pub fn unmap_name(&mut self, name: &str) -> crate::error::Result<()> {
        self.segments
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::seg_fault(format!("no such segment: {name}")))
    }

    /// Find the segment that owns `addr`.
    pub fn find_by_addr(&self, addr: Word) -> crate::error::Result<&Segment> {
        self.segments
            .values()
            .find(|seg| seg.contains(addr))
            .ok_or_else(|| EngineError::seg_fault(format!("cannot access memory address {addr:08x}")))
    }

    fn find_by_addr_mut(&mut self, addr: Word) -> crate::error::Result<&mut Segment> {
        self.segments
            .values_mut()
            .find(|seg| seg.contains(addr))
            .ok_or_else(|| EngineError::seg_fault(format!("cannot access memory address {addr:08x}")))
    }

    /// Read a single byte.
    pub fn read_byte(&self, addr: Word) -> crate::error::Result<u8> {
        self.find_by_addr(addr)?.read_byte(addr)
    }

    /// Write a single byte.
    pub fn write_byte(&mut self, addr: Word, value: u8) -> crate::error::Result<()> {
        self.find_by_addr_mut(addr)?.write_byte(addr, value)
    }

    /// Read `len` bytes starting at `addr`. The whole range must belong to
    /// one segment (cross-segment reads are not supported, matching the
    /// single-segment-ownership model of every mapped range).
    pub fn read_slice(&self, addr: Word, len: Word) -> crate::error::Result<&[u8]> {
        self.find_by_addr(addr)?.read_slice(addr, addr.saturating_add(len))
    }

    /// Write `data` starting at `addr`.
    pub fn write_slice(&mut self, addr: Word, data: &[u8]) -> crate::error::Result<()> {
        self.find_by_addr_mut(addr)?.write_slice(addr, data)
    }

    /// Fetch an executable instruction byte range `[addr, addr+len)`.
    pub fn read_exec_slice(&self, addr: Word, len: Word) -> crate::error::Result<&[u8]> {
        self.find_by_addr(addr)?.read_exec_slice(addr, addr.saturating_add(len))
    }

    /// Write a little-endian 32-bit word at `addr`.
    pub fn set32(&mut self, addr: Word, value: Word) -> crate::error::Result<()> {
        let addr = to_u32(addr as i64);
        self.write_slice(addr, &word_to_bytes(value))
    }

    /// Read a little-endian 32-bit word at `addr`.
    pub fn get32(&self, addr: Word) -> crate::error::Result<Word> {
        let addr = to_u32(addr as i64);
        let bytes = self.read_slice(addr, 4)?;
        Ok(bytes_to_word([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite the leading bytes of the named segment's backing buffer
    /// directly, bypassing its write-permission check. Used to load a
    /// program image into the (read+exec-only) code segment at boot and
    /// on `EXEC`.
    pub(crate) fn load_segment(&mut self, name: &str, data: &[u8]) -> crate::error::Result<()> {
        self.segments
            .get_mut(name)
            .ok_or_else(|| EngineError::seg_fault(format!("no such segment: {name}")))?
            .load(data);
        Ok(())
    }

    /// Read the NUL-terminated string starting at `addr`, not including the
    /// terminator. If no NUL byte is found before the end of the owning
    /// segment, the string runs to the end of the segment.
    pub fn get_cstring(&self, addr: Word) -> crate::error::Result<Vec<u8>> {
        let seg = self.find_by_addr(addr)?;
        let end = seg.find(0, addr).unwrap_or(seg.end());
        Ok(seg.read_slice(addr, end)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_one_segment() -> MemoryManager {
        let mut mm = MemoryManager::new();
        mm.map("bss", 0x1000, 0x100, Permission::rw(), &[]).unwrap();
        mm
    }

    #[test]
    fn word_round_trip() {
        let mut mm = manager_with_one_segment();
        mm.set32(0x1010, 0xDEAD_BEEF).unwrap();
        assert_eq!(mm.get32(0x1010).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn overlapping_map_is_alloc_fail() {
        let mut mm = manager_with_one_segment();
        assert!(mm.map("overlap", 0x1050, 0x10, Permission::rw(), &[]).is_err());
    }

    #[test]
    fn adjacent_map_is_allowed() {
        let mut mm = manager_with_one_segment();
        assert!(mm.map("next", 0x1100, 0x10, Permission::rw(), &[]).is_ok());
    }

    #[test]
    fn unmapped_address_is_seg_fault() {
        let mm = manager_with_one_segment();
        assert!(mm.get32(0x9000).is_err());
    }

    #[test]
    fn cstring_stops_at_nul() {
        let mut mm = manager_with_one_segment();
        mm.write_slice(0x1000, b"hello\0world").unwrap();
        assert_eq!(mm.get_cstring(0x1000).unwrap(), b"hello");
    }

    #[test]
    fn cstring_runs_to_segment_end_without_nul() {
        let mut mm = manager_with_one_segment();
        let data = vec![b'A'; 0x100];
        mm.write_slice(0x1000, &data).unwrap();
        assert_eq!(mm.get_cstring(0x1000).unwrap().len(), 0x100);
    }

    #[test]
    fn unmap_frees_the_range_for_remap() {
        let mut mm = manager_with_one_segment();
        mm.unmap_name("bss").unwrap();
        assert!(mm.map("bss2", 0x1000, 0x100, Permission::rw(), &[]).is_ok());
    }
}
