//! Segment layout: offset arithmetic over the mapped region and typed
//! accessors for the header, slot-RW array, checksum array, flexible
//! zone, and payload ring (§6.2 "Shared-memory segment layout").

use crate::checksum::SlotChecksum;
use crate::config::DataBlockConfig;
use crate::header::SegmentHeader;
use crate::slot::SlotRwState;
use datablock_common::consts::SLOT_CHECKSUM_SIZE;
use datablock_common::error::{DataBlockError, DataBlockResult};
use memmap2::MmapMut;

/// Byte offsets of each region within the mapped segment, derived once
/// from a [`DataBlockConfig`] (§4.1 step 1's size formula, generalised to
/// offsets rather than just a total).
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Offset of the slot-RW array (immediately after the header).
    pub slots_offset: usize,
    /// Offset of the checksum array, equal to `slots_offset` when
    /// checksums are disabled (zero-length region).
    pub checksums_offset: usize,
    /// Offset of the flexible metadata zone.
    pub flex_offset: usize,
    /// Offset of the payload ring.
    pub payload_offset: usize,
    /// Total segment size.
    pub total_size: usize,
    /// Ring capacity, cached for bounds checks.
    pub capacity: u32,
    /// Payload unit size in bytes, cached for bounds checks.
    pub unit_size: usize,
    /// Flexible-zone size in bytes, cached for bounds checks.
    pub flex_size: usize,
    /// Whether the checksum array is allocated.
    pub checksums_enabled: bool,
}

impl Layout {
    /// Compute a layout from a channel configuration.
    pub fn from_config(config: &DataBlockConfig) -> Self {
        let header_size = std::mem::size_of::<SegmentHeader>();
        let n = config.ring_capacity as usize;
        let slots_offset = header_size;
        let checksums_offset = slots_offset + n * std::mem::size_of::<SlotRwState>();
        let checksum_bytes = if config.checksum_policy.is_enabled() {
            n * SLOT_CHECKSUM_SIZE
        } else {
            0
        };
        let flex_offset = checksums_offset + checksum_bytes;
        let payload_offset = flex_offset + config.flex_zone_size;
        let total_size = payload_offset + n * config.unit_size.bytes();

        Self {
            slots_offset,
            checksums_offset,
            flex_offset,
            payload_offset,
            total_size,
            capacity: config.ring_capacity,
            unit_size: config.unit_size.bytes(),
            flex_size: config.flex_zone_size,
            checksums_enabled: config.checksum_policy.is_enabled(),
        }
    }

    /// Reconstruct a layout from a header already resident in a mapped
    /// segment, used on the consumer's attach path where no
    /// `DataBlockConfig` is available up front.
    pub fn from_header(header: &SegmentHeader) -> Self {
        let header_size = std::mem::size_of::<SegmentHeader>();
        let n = header.config.ring_capacity as usize;
        let checksums_enabled = header.config.checksum_enabled != 0;
        let slots_offset = header_size;
        let checksums_offset = slots_offset + n * std::mem::size_of::<SlotRwState>();
        let checksum_bytes = if checksums_enabled { n * SLOT_CHECKSUM_SIZE } else { 0 };
        let flex_offset = checksums_offset + checksum_bytes;
        let payload_offset = flex_offset + header.config.flex_zone_size as usize;
        let total_size = payload_offset + n * header.config.unit_size as usize;

        Self {
            slots_offset,
            checksums_offset,
            flex_offset,
            payload_offset,
            total_size,
            capacity: header.config.ring_capacity,
            unit_size: header.config.unit_size as usize,
            flex_size: header.config.flex_zone_size as usize,
            checksums_enabled,
        }
    }
}

/// A mapped DataBlock segment plus its derived layout. Shared, by
/// design, between however many threads in this process hold a
/// [`crate::producer::Producer`] or [`crate::consumer::Consumer`] over
/// it — every mutation through the accessors below goes through an
/// atomic or through the single-producer write-lock contract, so
/// aliasing `&self` into `&mut [u8]` for the active writer's slot is
/// sound in the same sense the platform mutex's `Send`/`Sync` impls are
/// (§5 "Shared-resource policy").
pub struct Segment {
    mmap: MmapMut,
    layout: Layout,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Wrap an already-mapped region with its derived layout.
    pub fn new(mmap: MmapMut, layout: Layout) -> Self {
        Self { mmap, layout }
    }

    /// The derived layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn base_mut(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Borrow the header.
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base_mut() as *const SegmentHeader) }
    }

    /// Physical slot index for a logical `slot_id`.
    pub fn slot_index(&self, slot_id: u64) -> usize {
        (slot_id % self.layout.capacity as u64) as usize
    }

    /// Borrow the RW-state record for physical slot `index`.
    ///
    /// # Panics
    /// Panics if `index >= capacity`; callers are expected to have
    /// derived `index` via [`Segment::slot_index`] or validated it
    /// against the layout's capacity themselves.
    pub fn slot_rw(&self, index: usize) -> &SlotRwState {
        assert!(index < self.layout.capacity as usize, "slot index out of range");
        unsafe {
            let ptr = self.base_mut().add(self.layout.slots_offset) as *const SlotRwState;
            &*ptr.add(index)
        }
    }

    /// Borrow the checksum record for physical slot `index`, if the
    /// checksum array is allocated.
    pub fn slot_checksum(&self, index: usize) -> Option<&SlotChecksum> {
        if !self.layout.checksums_enabled {
            return None;
        }
        assert!(index < self.layout.capacity as usize, "slot index out of range");
        unsafe {
            let ptr = self.base_mut().add(self.layout.checksums_offset) as *const SlotChecksum;
            Some(&*ptr.add(index))
        }
    }

    /// Mutable access to the checksum record for physical slot `index`.
    ///
    /// # Safety
    /// The caller must hold the slot's write lock, or otherwise know no
    /// concurrent mutator is touching this record — the same contract
    /// that governs `slot_payload_mut`.
    pub unsafe fn slot_checksum_mut(&self, index: usize) -> Option<&mut SlotChecksum> {
        if !self.layout.checksums_enabled {
            return None;
        }
        assert!(index < self.layout.capacity as usize, "slot index out of range");
        unsafe {
            let ptr = self.base_mut().add(self.layout.checksums_offset) as *mut SlotChecksum;
            Some(&mut *ptr.add(index))
        }
    }

    /// Read-only view of physical slot `index`'s payload bytes.
    pub fn slot_payload(&self, index: usize) -> &[u8] {
        assert!(index < self.layout.capacity as usize, "slot index out of range");
        let offset = self.layout.payload_offset + index * self.layout.unit_size;
        unsafe { std::slice::from_raw_parts(self.base_mut().add(offset), self.layout.unit_size) }
    }

    /// Mutable view of physical slot `index`'s payload bytes.
    ///
    /// # Safety
    /// The caller must hold the slot's write lock (i.e. be the
    /// `WriteHandle` owner for this slot); the single-producer contract
    /// and the write-lock CAS are what make this exclusive in practice.
    pub unsafe fn slot_payload_mut(&self, index: usize) -> &mut [u8] {
        assert!(index < self.layout.capacity as usize, "slot index out of range");
        let offset = self.layout.payload_offset + index * self.layout.unit_size;
        unsafe {
            std::slice::from_raw_parts_mut(self.base_mut().add(offset), self.layout.unit_size)
        }
    }

    /// Read-only view of the flexible zone.
    pub fn flex_zone(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.base_mut().add(self.layout.flex_offset), self.layout.flex_size)
        }
    }

    /// Mutable view of the flexible zone.
    ///
    /// # Safety
    /// The caller must hold the header's user spinlock dedicated to the
    /// flexible zone, or otherwise serialise access out of band — the
    /// core provides the spinlock primitive but does not enforce its use
    /// here (§3 "Flexible zone").
    pub unsafe fn flex_zone_mut(&self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base_mut().add(self.layout.flex_offset),
                self.layout.flex_size,
            )
        }
    }

    /// Validate that the mapped size is at least the layout's computed
    /// total (§4.1 "Failures": Windows `VirtualQuery` over-reports, so
    /// `observed >= expected`, never equality).
    pub fn validate_mapped_size(&self, name: &str, observed: usize) -> DataBlockResult<()> {
        if observed < self.layout.total_size {
            return Err(DataBlockError::SizeMismatch {
                name: name.to_string(),
                observed,
                expected: self.layout.total_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumPolicy, DataBlockConfig, UnitSize};

    fn test_config() -> DataBlockConfig {
        DataBlockConfig {
            ring_capacity: 4,
            unit_size: UnitSize::Small,
            flex_zone_size: 256,
            checksum_policy: ChecksumPolicy::Enforced,
            ..DataBlockConfig::default()
        }
    }

    #[test]
    fn layout_offsets_are_monotonically_increasing() {
        let layout = Layout::from_config(&test_config());
        assert!(layout.slots_offset < layout.checksums_offset);
        assert!(layout.checksums_offset < layout.flex_offset);
        assert!(layout.flex_offset < layout.payload_offset);
        assert!(layout.payload_offset < layout.total_size);
    }

    #[test]
    fn layout_without_checksums_has_zero_width_checksum_region() {
        let mut cfg = test_config();
        cfg.checksum_policy = ChecksumPolicy::Disabled;
        let layout = Layout::from_config(&cfg);
        assert_eq!(layout.slots_offset + 4 * std::mem::size_of::<SlotRwState>(), layout.checksums_offset);
        assert_eq!(layout.checksums_offset, layout.flex_offset);
    }

    #[test]
    fn segment_roundtrips_payload_bytes() {
        let cfg = test_config();
        let layout = Layout::from_config(&cfg);
        let mmap = MmapMut::map_anon(layout.total_size).unwrap();
        let segment = Segment::new(mmap, layout);

        unsafe {
            let buf = segment.slot_payload_mut(2);
            buf[0] = 0xAB;
            buf[1] = 0xCD;
        }
        let view = segment.slot_payload(2);
        assert_eq!(view[0], 0xAB);
        assert_eq!(view[1], 0xCD);
    }

    #[test]
    fn slot_index_wraps_by_capacity() {
        let cfg = test_config();
        let layout = Layout::from_config(&cfg);
        let mmap = MmapMut::map_anon(layout.total_size).unwrap();
        let segment = Segment::new(mmap, layout);
        assert_eq!(segment.slot_index(0), 0);
        assert_eq!(segment.slot_index(4), 0);
        assert_eq!(segment.slot_index(5), 1);
        assert_eq!(segment.slot_index(u64::MAX), (u64::MAX % 4) as usize);
    }

    #[test]
    fn validate_mapped_size_rejects_undersized_mapping() {
        let cfg = test_config();
        let layout = Layout::from_config(&cfg);
        let mmap = MmapMut::map_anon(layout.total_size).unwrap();
        let segment = Segment::new(mmap, layout);
        assert!(segment.validate_mapped_size("ch", layout.total_size).is_ok());
        assert!(segment.validate_mapped_size("ch", layout.total_size + 4096).is_ok());
        assert!(matches!(
            segment.validate_mapped_size("ch", layout.total_size - 1),
            Err(DataBlockError::SizeMismatch { .. })
        ));
    }
}
