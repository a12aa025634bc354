use core::fmt;

/// Total number of node slots addressable by the 10-bit slot field.
pub const SLOT_CAPACITY: u16 = 1 << 10;

/// Highest valid node slot.
pub const MAX_SLOT: u16 = SLOT_CAPACITY - 1;

/// Highest valid per-millisecond sequence value.
pub const MAX_SEQUENCE: u16 = (1 << 12) - 1;

/// A 64-bit Snowflake ID whose middle field is a leased node slot.
///
/// - 1 bit reserved
/// - 41 bits timestamp (ms since the generator's epoch)
/// - 10 bits node slot
/// - 12 bits sequence
///
/// ```text
///  Bit Index:  63           63 62            22 21         12 11             0
///              +--------------+----------------+-------------+---------------+
///  Field:      | reserved (1) | timestamp (41) | slot (10)   | sequence (12) |
///              +--------------+----------------+-------------+---------------+
///              |<----------- MSB -------- 64 bits --------- LSB ------------>|
/// ```
///
/// Ordering follows the raw integer, so IDs from one slot sort by issuance.
///
/// # Example
///
/// ```
/// use leaseflake::SnowflakeId;
///
/// let id = SnowflakeId::from_parts(1000, 2, 1);
/// assert_eq!(id.timestamp(), 1000);
/// assert_eq!(id.slot(), 2);
/// assert_eq!(id.sequence(), 1);
/// ```
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnowflakeId {
    id: u64,
}

impl SnowflakeId {
    /// Bitmask for extracting the 41-bit timestamp field. Occupies bits 22
    /// through 62.
    pub const TIMESTAMP_MASK: u64 = (1 << 41) - 1;

    /// Bitmask for extracting the 10-bit slot field. Occupies bits 12 through
    /// 21.
    pub const SLOT_MASK: u64 = (1 << 10) - 1;

    /// Bitmask for extracting the 12-bit sequence field. Occupies bits 0
    /// through 11.
    pub const SEQUENCE_MASK: u64 = (1 << 12) - 1;

    /// Number of bits to shift the timestamp to its correct position (bit 22).
    pub const TIMESTAMP_SHIFT: u64 = 22;

    /// Number of bits to shift the slot to its correct position (bit 12).
    pub const SLOT_SHIFT: u64 = 12;

    /// Number of bits to shift the sequence field (bit 0).
    pub const SEQUENCE_SHIFT: u64 = 0;

    /// Packs the three fields into an ID. Each field is truncated to its width.
    pub const fn from_parts(timestamp: u64, slot: u64, sequence: u64) -> Self {
        let timestamp = (timestamp & Self::TIMESTAMP_MASK) << Self::TIMESTAMP_SHIFT;
        let slot = (slot & Self::SLOT_MASK) << Self::SLOT_SHIFT;
        let sequence = (sequence & Self::SEQUENCE_MASK) << Self::SEQUENCE_SHIFT;
        Self {
            id: timestamp | slot | sequence,
        }
    }

    /// Wraps a raw value. The reserved bit is cleared.
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            id: raw & (u64::MAX >> 1),
        }
    }

    /// Returns the packed integer.
    pub const fn to_raw(&self) -> u64 {
        self.id
    }

    /// Extracts the timestamp delta (milliseconds since the epoch).
    pub const fn timestamp(&self) -> u64 {
        (self.id >> Self::TIMESTAMP_SHIFT) & Self::TIMESTAMP_MASK
    }

    /// Extracts the node slot.
    pub const fn slot(&self) -> u16 {
        ((self.id >> Self::SLOT_SHIFT) & Self::SLOT_MASK) as u16
    }

    /// Extracts the sequence number.
    pub const fn sequence(&self) -> u16 {
        ((self.id >> Self::SEQUENCE_SHIFT) & Self::SEQUENCE_MASK) as u16
    }

    /// Returns the absolute issuance time in milliseconds since the Unix
    /// epoch, given the epoch the ID was generated against.
    pub const fn unix_millis(&self, epoch_ms: u64) -> u64 {
        self.timestamp() + epoch_ms
    }

    /// Returns the ID as a zero-padded 20-digit string.
    pub fn to_padded_string(&self) -> String {
        format!("{:020}", self.id)
    }
}

impl From<SnowflakeId> for u64 {
    fn from(id: SnowflakeId) -> Self {
        id.to_raw()
    }
}

impl From<SnowflakeId> for i64 {
    fn from(id: SnowflakeId) -> Self {
        // The reserved bit is always clear, so this never goes negative.
        id.to_raw() as i64
    }
}

impl fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeId")
            .field("id", &format_args!("{} (0x{:016x})", self.id, self.id))
            .field("timestamp", &self.timestamp())
            .field("slot", &self.slot())
            .field("sequence", &self.sequence())
            .finish()
    }
}
