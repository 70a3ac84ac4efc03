//! Message buffer management for erpc-core.
//!
//! All message memory of an endpoint comes from one page-aligned, optionally
//! pinned region allocated at startup. [`HugeAlloc`] carves power-of-two
//! chunks out of it and hands out [`MsgBuffer`] handles (index + generation)
//! instead of pointers. A buffer's chunk is laid out so that every packet of
//! the message can be sent straight out of it:
//!
//! ```text
//! [hdr 0][data ............................][hdr 1][hdr 2]...[hdr n-1]
//!        |<- pkt 0 ->|<- pkt 1 ->|<- pkt 2 ->|
//! ```
//!
//! Header 0 sits right before the data so single-packet messages are
//! contiguous on the wire. Headers of later packets live after the data.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::{PKT_HDR_SIZE, calc_num_pkts, max_msg_size_for, pkt_data_len};

/// Page size alignment for pinned regions.
pub const PAGE_SIZE: usize = 4096;

/// Chunk alignment inside the arena (cache line).
pub const MSG_BUFFER_ALIGN: usize = 64;

/// Smallest chunk size class is 2^6 = 64 bytes.
const MIN_CLASS_SHIFT: u32 = 6;

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

// =============================================================================
// Aligned Region
// =============================================================================

/// A page-aligned heap region allocated with `posix_memalign`.
pub(crate) struct AlignedRegion {
    ptr: NonNull<u8>,
    len: usize,
    locked: bool,
}

impl AlignedRegion {
    /// Allocate a zeroed region of at least `len` bytes.
    ///
    /// With `pin`, the region is `mlock`ed on a best-effort basis.
    pub(crate) fn new(len: usize, pin: bool) -> Result<Self> {
        let len = len.max(1).next_multiple_of(PAGE_SIZE);
        let ptr = unsafe {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, len);
            if ret != 0 || ptr.is_null() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    format!("posix_memalign failed: {}", ret),
                )));
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, len);
            NonNull::new_unchecked(ptr as *mut u8)
        };

        let mut locked = false;
        if pin {
            let ret = unsafe { libc::mlock(ptr.as_ptr() as *const libc::c_void, len) };
            if ret == 0 {
                locked = true;
            } else {
                debug!(
                    len,
                    error = %std::io::Error::last_os_error(),
                    "mlock failed, region stays pageable"
                );
            }
        }

        Ok(Self { ptr, len, locked })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.len);
            }
            libc::free(self.ptr.as_ptr() as *mut libc::c_void);
        }
    }
}

// Safety: AlignedRegion owns its memory
unsafe impl Send for AlignedRegion {}

// =============================================================================
// MsgBuffer
// =============================================================================

/// Handle to a message buffer in an endpoint's arena.
///
/// The handle is deliberately neither `Clone` nor `Copy`: whoever holds it
/// owns the buffer, and freeing consumes it. Bytes are accessed through the
/// owning [`Rpc`](crate::Rpc) (or [`HugeAlloc`]).
#[derive(Debug, PartialEq, Eq)]
pub struct MsgBuffer {
    arena: u32,
    idx: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Byte offset of the chunk in the region.
    offset: usize,
    class: u32,
    /// Maximum data bytes.
    capacity: usize,
    /// Current data length.
    len: usize,
    generation: u32,
    live: bool,
}

// =============================================================================
// Arena Allocator
// =============================================================================

/// Arena allocator for [`MsgBuffer`]s.
///
/// Allocation is O(1): freed chunks go to a per-size-class free list, fresh
/// chunks are bump-allocated. The arena never grows; once the region is
/// used up and the matching free list is empty, `alloc` fails with
/// `OutOfMemory`.
pub struct HugeAlloc {
    region: AlignedRegion,
    id: u32,
    max_data_per_pkt: usize,
    bump: usize,
    entries: Vec<Entry>,
    free_entries: Vec<u32>,
    free_chunks: Vec<Vec<usize>>,
    live: usize,
}

impl HugeAlloc {
    /// Create an arena of `size` bytes for packets carrying up to
    /// `max_data_per_pkt` payload bytes each.
    pub fn new(size: usize, max_data_per_pkt: usize, pin: bool) -> Result<Self> {
        if max_data_per_pkt == 0 {
            return Err(Error::InvalidConfig("max_data_per_pkt cannot be 0".into()));
        }
        let region = AlignedRegion::new(size, pin)?;
        let num_classes = (usize::BITS - MIN_CLASS_SHIFT) as usize;
        Ok(Self {
            region,
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            max_data_per_pkt,
            bump: 0,
            entries: Vec::new(),
            free_entries: Vec::new(),
            free_chunks: (0..num_classes).map(|_| Vec::new()).collect(),
            live: 0,
        })
    }

    /// Payload bytes per packet this arena lays buffers out for.
    #[inline]
    pub fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    /// Total size of the backing region.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.region.len()
    }

    /// Number of buffers currently allocated.
    #[inline]
    pub fn live_buffers(&self) -> usize {
        self.live
    }

    /// Bytes a buffer of `max_data_size` data bytes occupies, headers included.
    fn chunk_bytes(&self, max_data_size: usize) -> usize {
        let num_pkts = calc_num_pkts(max_data_size, self.max_data_per_pkt) as usize;
        max_data_size + num_pkts * PKT_HDR_SIZE
    }

    /// Allocate a buffer with room for `max_data_size` data bytes.
    ///
    /// The buffer's length starts out equal to its capacity.
    pub fn alloc(&mut self, max_data_size: usize) -> Result<MsgBuffer> {
        let oom = Error::OutOfMemory {
            requested: max_data_size,
        };
        if max_data_size > max_msg_size_for(self.max_data_per_pkt) {
            return Err(oom);
        }
        let bytes = self.chunk_bytes(max_data_size);
        if bytes > self.region.len() {
            return Err(oom);
        }
        let class = bytes
            .next_power_of_two()
            .trailing_zeros()
            .saturating_sub(MIN_CLASS_SHIFT);
        let chunk_size = 1usize << (class + MIN_CLASS_SHIFT);

        let offset = match self.free_chunks[class as usize].pop() {
            Some(offset) => offset,
            None => {
                let offset = self.bump.next_multiple_of(MSG_BUFFER_ALIGN);
                if offset + chunk_size > self.region.len() {
                    return Err(oom);
                }
                self.bump = offset + chunk_size;
                offset
            }
        };

        let entry = Entry {
            offset,
            class,
            capacity: max_data_size,
            len: max_data_size,
            generation: 0,
            live: true,
        };
        let (idx, generation) = match self.free_entries.pop() {
            Some(idx) => {
                let slot = &mut self.entries[idx as usize];
                let generation = slot.generation;
                *slot = Entry { generation, ..entry };
                (idx, generation)
            }
            None => {
                self.entries.push(entry);
                ((self.entries.len() - 1) as u32, 0)
            }
        };
        self.live += 1;

        Ok(MsgBuffer {
            arena: self.id,
            idx,
            generation,
        })
    }

    /// Return a buffer to the arena.
    pub fn free(&mut self, buf: MsgBuffer) -> Result<()> {
        let entry = *self.entry(&buf)?;
        self.free_chunks[entry.class as usize].push(entry.offset);
        let slot = &mut self.entries[buf.idx as usize];
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_entries.push(buf.idx);
        self.live -= 1;
        Ok(())
    }

    fn entry(&self, buf: &MsgBuffer) -> Result<&Entry> {
        if buf.arena != self.id {
            return Err(Error::InvalidMsgBuffer);
        }
        match self.entries.get(buf.idx as usize) {
            Some(e) if e.live && e.generation == buf.generation => Ok(e),
            _ => Err(Error::InvalidMsgBuffer),
        }
    }

    /// Check that `buf` is a live buffer of this arena.
    #[inline]
    pub fn is_valid(&self, buf: &MsgBuffer) -> bool {
        self.entry(buf).is_ok()
    }

    /// Current data length.
    pub fn len(&self, buf: &MsgBuffer) -> Result<usize> {
        Ok(self.entry(buf)?.len)
    }

    /// Maximum data length.
    pub fn capacity(&self, buf: &MsgBuffer) -> Result<usize> {
        Ok(self.entry(buf)?.capacity)
    }

    /// Number of packets the buffer's current contents span.
    pub fn num_pkts(&self, buf: &MsgBuffer) -> Result<u16> {
        Ok(calc_num_pkts(self.entry(buf)?.len, self.max_data_per_pkt))
    }

    /// Change the data length within the allocated capacity.
    pub fn resize(&mut self, buf: &MsgBuffer, new_len: usize) -> Result<()> {
        let entry = *self.entry(buf)?;
        if new_len > entry.capacity {
            return Err(Error::BufferTooSmall {
                required: new_len,
                available: entry.capacity,
            });
        }
        self.entries[buf.idx as usize].len = new_len;
        Ok(())
    }

    /// Data pointer and current length, detached from the arena borrow.
    ///
    /// The pointer stays valid until `buf` is freed or the arena is dropped.
    pub(crate) fn data_raw(&self, buf: &MsgBuffer) -> Result<(*mut u8, usize)> {
        let entry = self.entry(buf)?;
        let ptr = unsafe { self.region.as_ptr().add(entry.offset + PKT_HDR_SIZE) };
        Ok((ptr, entry.len))
    }

    /// The buffer's data bytes.
    pub fn data(&self, buf: &MsgBuffer) -> Result<&[u8]> {
        let (ptr, len) = self.data_raw(buf)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// The buffer's data bytes, mutably.
    pub fn data_mut(&mut self, buf: &MsgBuffer) -> Result<&mut [u8]> {
        let (ptr, len) = self.data_raw(buf)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Resize to `data.len()` and copy `data` in.
    pub fn write(&mut self, buf: &MsgBuffer, data: &[u8]) -> Result<()> {
        self.resize(buf, data.len())?;
        self.data_mut(buf)?.copy_from_slice(data);
        Ok(())
    }

    /// Copy `bytes` to data offset `offset`, bounded by capacity.
    pub fn write_at(&mut self, buf: &MsgBuffer, offset: usize, bytes: &[u8]) -> Result<()> {
        let entry = *self.entry(buf)?;
        let end = offset + bytes.len();
        if end > entry.capacity {
            return Err(Error::BufferTooSmall {
                required: end,
                available: entry.capacity,
            });
        }
        unsafe {
            let dst = self.region.as_ptr().add(entry.offset + PKT_HDR_SIZE + offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    fn hdr_offset(&self, entry: &Entry, pkt_num: u16) -> usize {
        if pkt_num == 0 {
            entry.offset
        } else {
            entry.offset + PKT_HDR_SIZE + entry.capacity + (pkt_num as usize - 1) * PKT_HDR_SIZE
        }
    }

    fn check_pkt(&self, entry: &Entry, pkt_num: u16) -> Result<()> {
        let num_pkts = calc_num_pkts(entry.len, self.max_data_per_pkt);
        if pkt_num >= num_pkts {
            return Err(Error::BufferTooSmall {
                required: pkt_num as usize + 1,
                available: num_pkts as usize,
            });
        }
        Ok(())
    }

    /// Header slot of packet `pkt_num`.
    pub fn pkt_hdr_mut(&mut self, buf: &MsgBuffer, pkt_num: u16) -> Result<&mut [u8]> {
        let entry = *self.entry(buf)?;
        self.check_pkt(&entry, pkt_num)?;
        let off = self.hdr_offset(&entry, pkt_num);
        Ok(unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(off), PKT_HDR_SIZE) })
    }

    /// Zero-copy view of packet `pkt_num`: its header slot and its data.
    pub fn pkt(&self, buf: &MsgBuffer, pkt_num: u16) -> Result<(&[u8], &[u8])> {
        let entry = self.entry(buf)?;
        self.check_pkt(entry, pkt_num)?;
        let base = self.region.as_ptr();
        let hdr_off = self.hdr_offset(entry, pkt_num);
        let data_off = entry.offset + PKT_HDR_SIZE + pkt_num as usize * self.max_data_per_pkt;
        let data_len = pkt_data_len(entry.len, pkt_num, self.max_data_per_pkt);
        unsafe {
            Ok((
                std::slice::from_raw_parts(base.add(hdr_off), PKT_HDR_SIZE),
                std::slice::from_raw_parts(base.add(data_off), data_len),
            ))
        }
    }
}

// =============================================================================
// Receive Ring
// =============================================================================

/// Pinned receive ring shared between an endpoint and its transport.
///
/// The transport writes a burst of packets into consecutive slots starting at
/// the ring head (`batch_slot_mut` / `set_batch_len`), the endpoint reads
/// them in place (`batch_pkt`) and then releases the slots with `advance`.
pub struct RxRing {
    region: AlignedRegion,
    slot_size: usize,
    num_slots: usize,
    max_batch: usize,
    lens: Box<[usize]>,
    head: usize,
}

impl RxRing {
    /// Create a ring of `num_slots` slots of `slot_size` bytes.
    pub fn new(num_slots: usize, slot_size: usize, max_batch: usize, pin: bool) -> Result<Self> {
        if num_slots == 0 || slot_size == 0 {
            return Err(Error::InvalidConfig("receive ring cannot be empty".into()));
        }
        let region = AlignedRegion::new(num_slots * slot_size, pin)?;
        Ok(Self {
            region,
            slot_size,
            num_slots,
            max_batch: max_batch.clamp(1, num_slots),
            lens: vec![0; num_slots].into_boxed_slice(),
            head: 0,
        })
    }

    /// Size of each slot in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots.
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Maximum packets a transport may deliver in one `rx_burst`.
    #[inline]
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    #[inline]
    fn slot_idx(&self, k: usize) -> usize {
        debug_assert!(k < self.max_batch);
        (self.head + k) % self.num_slots
    }

    /// Writable slot for the `k`-th packet of the current burst.
    pub fn batch_slot_mut(&mut self, k: usize) -> &mut [u8] {
        let idx = self.slot_idx(k);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.region.as_ptr().add(idx * self.slot_size),
                self.slot_size,
            )
        }
    }

    /// Record the length of the `k`-th packet of the current burst.
    pub fn set_batch_len(&mut self, k: usize, len: usize) {
        let idx = self.slot_idx(k);
        self.lens[idx] = len.min(self.slot_size);
    }

    /// The `k`-th received packet of the current burst.
    pub fn batch_pkt(&self, k: usize) -> &[u8] {
        let idx = self.slot_idx(k);
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(idx * self.slot_size),
                self.lens[idx],
            )
        }
    }

    /// Release the first `n` packets of the burst back to the transport.
    pub fn advance(&mut self, n: usize) {
        self.head = (self.head + n) % self.num_slots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDPP: usize = 1000;

    fn arena(size: usize) -> HugeAlloc {
        HugeAlloc::new(size, MDPP, false).unwrap()
    }

    #[test]
    fn test_alloc_free_reuse() {
        let mut alloc = arena(1 << 20);
        let buf = alloc.alloc(100).unwrap();
        assert_eq!(alloc.len(&buf).unwrap(), 100);
        assert_eq!(alloc.capacity(&buf).unwrap(), 100);
        assert_eq!(alloc.live_buffers(), 1);

        let (ptr, _) = alloc.data_raw(&buf).unwrap();
        alloc.free(buf).unwrap();
        assert_eq!(alloc.live_buffers(), 0);

        // Same size class comes back from the free list.
        let buf2 = alloc.alloc(90).unwrap();
        assert_eq!(alloc.data_raw(&buf2).unwrap().0, ptr);
    }

    #[test]
    fn test_stale_and_foreign_handles() {
        let mut a = arena(1 << 16);
        let b = arena(1 << 16);
        let buf = a.alloc(10).unwrap();
        assert!(!b.is_valid(&buf));
        assert!(matches!(b.len(&buf), Err(Error::InvalidMsgBuffer)));

        let forged = MsgBuffer {
            arena: buf.arena,
            idx: buf.idx,
            generation: buf.generation,
        };
        a.free(buf).unwrap();
        assert!(matches!(a.free(forged), Err(Error::InvalidMsgBuffer)));
    }

    #[test]
    fn test_out_of_memory() {
        let mut alloc = arena(PAGE_SIZE);
        // 2100 data bytes + 3 headers round up to a 4 KiB chunk.
        let _a = alloc.alloc(2100).unwrap();
        assert!(matches!(
            alloc.alloc(2100),
            Err(Error::OutOfMemory { requested: 2100 })
        ));
        assert!(matches!(
            alloc.alloc(1 << 20),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_resize_within_capacity() {
        let mut alloc = arena(1 << 16);
        let buf = alloc.alloc(64).unwrap();
        alloc.resize(&buf, 10).unwrap();
        assert_eq!(alloc.data(&buf).unwrap().len(), 10);
        alloc.resize(&buf, 64).unwrap();
        assert!(matches!(
            alloc.resize(&buf, 65),
            Err(Error::BufferTooSmall {
                required: 65,
                available: 64
            })
        ));
    }

    #[test]
    fn test_pkt_views_cover_message() {
        let mut alloc = arena(1 << 16);
        let buf = alloc.alloc(2500).unwrap();
        let msg: Vec<u8> = (0..2500).map(|i| (i % 251) as u8).collect();
        alloc.write(&buf, &msg).unwrap();
        assert_eq!(alloc.num_pkts(&buf).unwrap(), 3);

        let mut joined = Vec::new();
        for i in 0..3 {
            alloc.pkt_hdr_mut(&buf, i).unwrap().fill(i as u8 + 1);
            let (hdr, data) = alloc.pkt(&buf, i).unwrap();
            assert_eq!(hdr.len(), PKT_HDR_SIZE);
            joined.extend_from_slice(data);
        }
        assert_eq!(joined, msg);
        assert!(alloc.pkt(&buf, 3).is_err());

        // Header slots never overlap the data.
        assert_eq!(alloc.data(&buf).unwrap(), &msg[..]);
        for i in 0..3 {
            assert!(alloc.pkt(&buf, i).unwrap().0.iter().all(|&b| b == i as u8 + 1));
        }
    }

    #[test]
    fn test_zero_length_buffer_has_one_pkt() {
        let mut alloc = arena(1 << 16);
        let buf = alloc.alloc(0).unwrap();
        assert_eq!(alloc.num_pkts(&buf).unwrap(), 1);
        let (_, data) = alloc.pkt(&buf, 0).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_alignment() {
        let mut alloc = arena(1 << 16);
        for size in [0, 1, 100, 1000, 3000] {
            let buf = alloc.alloc(size).unwrap();
            let (ptr, _) = alloc.data_raw(&buf).unwrap();
            assert_eq!((ptr as usize - PKT_HDR_SIZE) % MSG_BUFFER_ALIGN, 0);
        }
    }

    #[test]
    fn test_rx_ring_wraps() {
        let mut ring = RxRing::new(4, 64, 4, false).unwrap();
        for round in 0..3u8 {
            for k in 0..3 {
                ring.batch_slot_mut(k)[..2].copy_from_slice(&[round, k as u8]);
                ring.set_batch_len(k, 2);
            }
            for k in 0..3 {
                assert_eq!(ring.batch_pkt(k), &[round, k as u8]);
            }
            ring.advance(3);
        }
    }
}
