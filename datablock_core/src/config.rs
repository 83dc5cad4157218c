//! Channel configuration: ring capacity, unit size, checksum policy, schema
//! identity, and the derived ring-buffer policy.

use datablock_common::consts::{
    MIN_RING_CAPACITY, RING_POLICY_THRESHOLD, SCHEMA_HASH_SIZE, UNIT_SIZE_LARGE, UNIT_SIZE_MEDIUM,
    UNIT_SIZE_SMALL,
};
use datablock_common::error::{DataBlockError, DataBlockResult};
use std::time::Duration;

/// Back-pressure behaviour implied by the ring capacity (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPolicy {
    /// Capacity 1. Every write reclaims the same slot; never blocks on
    /// ring-full, always drains readers first.
    SingleSlot,
    /// Capacity 2. Writer alternates slots, never blocks on ring-full.
    DoubleBuffer,
    /// Capacity >= 3. Writer blocks (with timeout) once
    /// `write_index - read_index >= N`.
    Ring,
}

impl RingPolicy {
    /// Derive the policy implied by a ring capacity.
    pub fn from_capacity(capacity: u32) -> Self {
        if capacity <= 1 {
            RingPolicy::SingleSlot
        } else if capacity == 2 {
            RingPolicy::DoubleBuffer
        } else {
            RingPolicy::Ring
        }
    }

    /// Whether this policy ever blocks the writer on a full ring.
    pub fn blocks_on_full(self) -> bool {
        matches!(self, RingPolicy::Ring)
    }
}

/// Permitted payload unit sizes (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSize {
    /// 4 KiB slots.
    Small,
    /// 4 MiB slots.
    Medium,
    /// 16 MiB slots.
    Large,
}

impl UnitSize {
    /// Byte count for this unit size.
    pub fn bytes(self) -> usize {
        match self {
            UnitSize::Small => UNIT_SIZE_SMALL,
            UnitSize::Medium => UNIT_SIZE_MEDIUM,
            UnitSize::Large => UNIT_SIZE_LARGE,
        }
    }
}

/// Checksum enable/policy for slot payloads (§3, §4.2/§4.3).
///
/// Flexible-zone checksums are always manual regardless of this setting —
/// there is no "enforced" mode for the flexible zone (§3 Invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// No checksum field is maintained.
    Disabled,
    /// `commit` writes the checksum and read-release verifies it
    /// automatically.
    Enforced,
    /// The checksum field exists but only the caller updates/verifies it.
    Manual,
}

impl ChecksumPolicy {
    /// Whether a per-slot checksum array is allocated at all.
    pub fn is_enabled(self) -> bool {
        !matches!(self, ChecksumPolicy::Disabled)
    }

    /// Whether commit/release maintain the checksum automatically.
    pub fn is_enforced(self) -> bool {
        matches!(self, ChecksumPolicy::Enforced)
    }
}

/// One field of a canonicalised schema, used to compute a stable hash.
///
/// Nested structs are flattened by the caller before construction — the
/// hash is over the flattened field list, not over a recursive descent, so
/// two language bindings that agree on the flattened layout agree on the
/// hash even if their native struct nesting differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name, used verbatim in the canonical encoding.
    pub name: String,
    /// Byte offset of the field within the record.
    pub offset: usize,
    /// Size in bytes of the field.
    pub size: usize,
}

/// Canonical description of a record type, used to derive the 32-byte
/// schema hash stored in the segment header.
///
/// # Canonicalisation
///
/// The source left the schema-hash algorithm unspecified beyond "something
/// that accounts for nested structs and padding". This implementation
/// canonicalises a schema as the UTF-8 encoding of:
///
/// ```text
/// "<type_name>;<size>;<align>;<field0.name>:<field0.offset>:<field0.size>;..."
/// ```
///
/// fields sorted by offset, and hashes the result with BLAKE3 to a 32-byte
/// digest. Two schemas with the same flattened field layout hash identically
/// regardless of source-language struct nesting; any change to field order,
/// offset, size, padding-induced offset shift, or overall size/align changes
/// the hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    /// Name of the record type, informational only (included in the hash
    /// so renaming a type invalidates compatibility, matching the
    /// source's intent that the hash is a strict fingerprint).
    pub type_name: String,
    /// `size_of::<T>()` of the record type.
    pub size: usize,
    /// `align_of::<T>()` of the record type.
    pub align: usize,
    /// Flattened field list.
    pub fields: Vec<FieldDescriptor>,
    /// Monotonic schema version, independent of the hash; bumped by the
    /// producer whenever the schema changes in a way callers should be
    /// told about even if the hash also changed.
    pub version: u32,
}

impl SchemaDescriptor {
    /// Canonical byte encoding fed to the hash function.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut fields = self.fields.clone();
        fields.sort_by_key(|f| f.offset);

        let mut out = format!("{};{};{}", self.type_name, self.size, self.align);
        for f in &fields {
            out.push(';');
            out.push_str(&format!("{}:{}:{}", f.name, f.offset, f.size));
        }
        out.into_bytes()
    }

    /// Compute the 32-byte schema hash.
    pub fn hash(&self) -> [u8; SCHEMA_HASH_SIZE] {
        *blake3::hash(&self.canonical_bytes()).as_bytes()
    }

    /// The all-zero hash and version 0, which disables schema checking on
    /// attach (escape hatch for callers who don't want the check).
    pub fn disabled() -> ([u8; SCHEMA_HASH_SIZE], u32) {
        ([0u8; SCHEMA_HASH_SIZE], 0)
    }
}

/// Full configuration for creating a new channel (§4.1).
#[derive(Debug, Clone)]
pub struct DataBlockConfig {
    /// Ring capacity `N >= 1`.
    pub ring_capacity: u32,
    /// Payload slot size.
    pub unit_size: UnitSize,
    /// Size in bytes of the flexible metadata zone.
    pub flex_zone_size: usize,
    /// Checksum enable + policy.
    pub checksum_policy: ChecksumPolicy,
    /// 128-bit capability token, not encryption (§1 Non-goals).
    pub shared_secret: u128,
    /// Schema hash stored in the header; `[0; 32]` disables schema
    /// checking on attach.
    pub schema_hash: [u8; SCHEMA_HASH_SIZE],
    /// Schema version stored alongside the hash.
    pub schema_version: u32,
    /// Bounded wait for a consumer's attach spin on `init_state`.
    pub init_timeout: Duration,
    /// Heartbeat staleness timeout (source: 1-5s observed, this spec
    /// fixes the default at 5s; see [`datablock_common::consts::DEFAULT_HEARTBEAT_TIMEOUT_MS`]).
    pub heartbeat_timeout: Duration,
}

impl DataBlockConfig {
    /// Build a config from a [`SchemaDescriptor`], computing the hash.
    pub fn with_schema(mut self, schema: &SchemaDescriptor) -> Self {
        self.schema_hash = schema.hash();
        self.schema_version = schema.version;
        self
    }

    /// The ring policy this configuration implies.
    pub fn ring_policy(&self) -> RingPolicy {
        RingPolicy::from_capacity(self.ring_capacity)
    }

    /// Validate the configuration; called by `Producer::create`.
    pub fn validate(&self) -> DataBlockResult<()> {
        if self.ring_capacity < MIN_RING_CAPACITY {
            return Err(DataBlockError::InvalidConfig {
                reason: format!(
                    "ring_capacity {} is below minimum {}",
                    self.ring_capacity, MIN_RING_CAPACITY
                ),
            });
        }
        if self.unit_size.bytes() == 0 {
            return Err(DataBlockError::InvalidConfig {
                reason: "unit_size must be nonzero".to_string(),
            });
        }
        Ok(())
    }

    /// Total segment size in bytes (§4.1, formula):
    /// `sizeof(Header) + N*sizeof(SlotRwState) + (checksum? N*33 : 0) + flex_size + N*unit_size`.
    pub fn total_segment_size(&self) -> usize {
        use crate::header::SegmentHeader;
        use crate::slot::SlotRwState;
        use datablock_common::consts::SLOT_CHECKSUM_SIZE;

        let n = self.ring_capacity as usize;
        let mut total = std::mem::size_of::<SegmentHeader>();
        total += n * std::mem::size_of::<SlotRwState>();
        if self.checksum_policy.is_enabled() {
            total += n * SLOT_CHECKSUM_SIZE;
        }
        total += self.flex_zone_size;
        total += n * self.unit_size.bytes();
        total
    }
}

impl Default for DataBlockConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4,
            unit_size: UnitSize::Small,
            flex_zone_size: 4096,
            checksum_policy: ChecksumPolicy::Disabled,
            shared_secret: 0,
            schema_hash: [0u8; SCHEMA_HASH_SIZE],
            schema_version: 0,
            init_timeout: Duration::from_millis(
                datablock_common::consts::DEFAULT_INIT_TIMEOUT_MS,
            ),
            heartbeat_timeout: Duration::from_millis(
                datablock_common::consts::DEFAULT_HEARTBEAT_TIMEOUT_MS,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_policy_boundaries() {
        assert_eq!(RingPolicy::from_capacity(1), RingPolicy::SingleSlot);
        assert_eq!(RingPolicy::from_capacity(2), RingPolicy::DoubleBuffer);
        assert_eq!(RingPolicy::from_capacity(3), RingPolicy::Ring);
        assert_eq!(RingPolicy::from_capacity(RING_POLICY_THRESHOLD), RingPolicy::Ring);
        assert!(!RingPolicy::SingleSlot.blocks_on_full());
        assert!(!RingPolicy::DoubleBuffer.blocks_on_full());
        assert!(RingPolicy::Ring.blocks_on_full());
    }

    #[test]
    fn schema_hash_is_deterministic_and_order_independent() {
        let a = SchemaDescriptor {
            type_name: "Tick".to_string(),
            size: 16,
            align: 8,
            fields: vec![
                FieldDescriptor { name: "price".to_string(), offset: 0, size: 8 },
                FieldDescriptor { name: "qty".to_string(), offset: 8, size: 8 },
            ],
            version: 1,
        };
        let b = SchemaDescriptor {
            fields: vec![
                FieldDescriptor { name: "qty".to_string(), offset: 8, size: 8 },
                FieldDescriptor { name: "price".to_string(), offset: 0, size: 8 },
            ],
            ..a.clone()
        };
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn schema_hash_changes_with_layout() {
        let a = SchemaDescriptor {
            type_name: "Tick".to_string(),
            size: 16,
            align: 8,
            fields: vec![FieldDescriptor { name: "price".to_string(), offset: 0, size: 8 }],
            version: 1,
        };
        let mut b = a.clone();
        b.size = 24;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn disabled_schema_is_all_zero() {
        let (hash, version) = SchemaDescriptor::disabled();
        assert_eq!(hash, [0u8; SCHEMA_HASH_SIZE]);
        assert_eq!(version, 0);
    }

    #[test]
    fn default_config_validates() {
        assert!(DataBlockConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut cfg = DataBlockConfig::default();
        cfg.ring_capacity = 0;
        assert!(matches!(
            cfg.validate(),
            Err(DataBlockError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn total_segment_size_accounts_for_checksum_array() {
        let mut cfg = DataBlockConfig::default();
        cfg.checksum_policy = ChecksumPolicy::Disabled;
        let without = cfg.total_segment_size();
        cfg.checksum_policy = ChecksumPolicy::Enforced;
        let with = cfg.total_segment_size();
        assert_eq!(with - without, cfg.ring_capacity as usize * 33);
    }
}
