//! Header list wire layout
//!
//! Every container owns one fixed-size header segment, created once and never
//! reallocated. All offsets below are load-bearing for cross-process
//! attachment; integers are little-endian and strings are NUL-padded UTF-8.
//!
//! | Offset | Width | Field |
//! |--------|-------|-------|
//! | 0      | 64    | embedded process-shared mutex |
//! | 64     | 4     | magic `"SCRP"` |
//! | 68     | 2     | layout version |
//! | 70     | 1     | container kind |
//! | 71     | 1     | flags |
//! | 72     | 8     | layout epoch |
//! | 80     | 128   | data segment name |
//! | 208    | 8     | logical size (bytes) |
//! | 216    | 8     | capacity (bytes) |
//! | 224    | 64    | external lock segment name (empty when embedded) |
//! | 288    | 224   | container-specific slots |
//!
//! The first 80 bytes are bookkeeping for locking, validation and relocation.
//! From offset 80 on the slots run in their portable order: data name, logical
//! size, capacity, then the container-specific slots. The lock name is the one
//! addition between capacity and the container-specific slots.

use crate::lock::{ProcessMutex, LOCK_AREA_SIZE};
use crate::SharedMemoryRegion;
use scratchpad_core::{Result, ScratchpadError};
use std::fmt;

/// Header magic number
pub const HEADER_MAGIC: u32 = 0x5343_5250; // "SCRP"

/// Current header layout version
pub const HEADER_VERSION: u16 = 1;

/// Total header size in bytes
pub const HEADER_SIZE: usize = 512;

/// Byte offsets of the header slots
pub mod slot {
    pub const LOCK: usize = 0;
    pub const MAGIC: usize = 64;
    pub const VERSION: usize = 68;
    pub const KIND: usize = 70;
    pub const FLAGS: usize = 71;
    pub const EPOCH: usize = 72;
    pub const DATA_NAME: usize = 80;
    pub const LOGICAL_SIZE: usize = 208;
    pub const CAPACITY: usize = 216;
    pub const LOCK_NAME: usize = 224;
    pub const EXTENSION: usize = 288;

    pub const DATA_NAME_WIDTH: usize = 128;
    pub const LOCK_NAME_WIDTH: usize = 64;
    pub const EXTENSION_WIDTH: usize = super::HEADER_SIZE - EXTENSION;
}

const FLAG_DESTROYED: u8 = 0x01;

/// Which container a header describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContainerKind {
    Vector = 0x01,
    Array = 0x02,
    Dict = 0x03,
}

impl TryFrom<u8> for ContainerKind {
    type Error = ScratchpadError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ContainerKind::Vector),
            0x02 => Ok(ContainerKind::Array),
            0x03 => Ok(ContainerKind::Dict),
            other => Err(ScratchpadError::Type(format!("invalid container kind {:#04x}", other))),
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Vector => f.write_str("vector"),
            ContainerKind::Array => f.write_str("array"),
            ContainerKind::Dict => f.write_str("dict"),
        }
    }
}

/// Common fields written when a header is created
#[derive(Debug, Clone)]
pub struct HeaderFields {
    pub kind: ContainerKind,
    pub data_name: String,
    pub logical_size: usize,
    pub capacity: usize,
    pub lock_name: Option<String>,
}

/// Typed accessors over a header segment
///
/// Field accessors do not lock; callers hold the container lock around any
/// sequence of reads and writes that must be consistent.
pub struct HeaderList {
    mutex: ProcessMutex,
    region: SharedMemoryRegion,
}

impl HeaderList {
    /// Lay out a fresh header in `region`
    pub(crate) fn initialize(region: SharedMemoryRegion, fields: &HeaderFields) -> Result<Self> {
        if region.len() < HEADER_SIZE {
            return Err(ScratchpadError::Value(format!(
                "header segment of {} bytes is smaller than {}",
                region.len(),
                HEADER_SIZE
            )));
        }
        let mutex = unsafe { ProcessMutex::initialize(region.as_mut_ptr().add(slot::LOCK))? };
        let header = Self { mutex, region };

        header.write_u16(slot::VERSION, HEADER_VERSION)?;
        header.write_u8(slot::KIND, fields.kind as u8)?;
        header.write_u8(slot::FLAGS, 0)?;
        header.write_u64(slot::EPOCH, 0)?;
        header.set_data_name(&fields.data_name)?;
        header.set_logical_size(fields.logical_size)?;
        header.set_capacity(fields.capacity)?;
        header.write_str(
            slot::LOCK_NAME,
            slot::LOCK_NAME_WIDTH,
            fields.lock_name.as_deref().unwrap_or(""),
        )?;
        header.write_u32(slot::MAGIC, HEADER_MAGIC)?;
        Ok(header)
    }

    /// Validate and wrap an existing header in `region`
    pub(crate) fn attach(region: SharedMemoryRegion) -> Result<Self> {
        if region.len() < HEADER_SIZE {
            return Err(ScratchpadError::Type(format!(
                "{} is too small to be a container header",
                region.name()
            )));
        }
        let mutex = unsafe { ProcessMutex::attach(region.as_mut_ptr().add(slot::LOCK))? };
        let header = Self { mutex, region };
        if header.read_u32(slot::MAGIC)? != HEADER_MAGIC {
            return Err(ScratchpadError::Type(format!(
                "{} is not a container header",
                header.name()
            )));
        }
        let version = header.read_u16(slot::VERSION)?;
        if version != HEADER_VERSION {
            return Err(ScratchpadError::Type(format!(
                "unsupported header version {} (expected {})",
                version, HEADER_VERSION
            )));
        }
        Ok(header)
    }

    /// Public name of the header segment
    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn is_creator(&self) -> bool {
        self.region.is_creator()
    }

    /// The embedded lock
    pub fn mutex(&self) -> &ProcessMutex {
        &self.mutex
    }

    pub fn kind(&self) -> Result<ContainerKind> {
        ContainerKind::try_from(self.read_u8(slot::KIND)?)
    }

    pub fn epoch(&self) -> Result<u64> {
        self.read_u64(slot::EPOCH)
    }

    /// Advance the layout epoch and return the new value
    pub fn bump_epoch(&self) -> Result<u64> {
        let next = self.epoch()?.wrapping_add(1);
        self.write_u64(slot::EPOCH, next)?;
        Ok(next)
    }

    pub fn data_name(&self) -> Result<String> {
        self.read_str(slot::DATA_NAME, slot::DATA_NAME_WIDTH)
    }

    pub fn set_data_name(&self, name: &str) -> Result<()> {
        self.write_str(slot::DATA_NAME, slot::DATA_NAME_WIDTH, name)
    }

    pub fn logical_size(&self) -> Result<usize> {
        self.read_size(slot::LOGICAL_SIZE)
    }

    pub fn set_logical_size(&self, size: usize) -> Result<()> {
        self.write_u64(slot::LOGICAL_SIZE, size as u64)
    }

    pub fn capacity(&self) -> Result<usize> {
        self.read_size(slot::CAPACITY)
    }

    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        self.write_u64(slot::CAPACITY, capacity as u64)
    }

    /// Name of the external lock segment, if the container uses one
    pub fn lock_name(&self) -> Result<Option<String>> {
        let name = self.read_str(slot::LOCK_NAME, slot::LOCK_NAME_WIDTH)?;
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    pub fn is_destroyed(&self) -> Result<bool> {
        Ok(self.read_u8(slot::FLAGS)? & FLAG_DESTROYED != 0)
    }

    pub fn mark_destroyed(&self) -> Result<()> {
        let flags = self.read_u8(slot::FLAGS)?;
        self.write_u8(slot::FLAGS, flags | FLAG_DESTROYED)
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.region.read_at(offset, buf)
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.region.write_at(offset, data)
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        let mut raw = [0u8; 1];
        self.region.read_at(offset, &mut raw)?;
        Ok(raw[0])
    }

    pub fn write_u8(&self, offset: usize, value: u8) -> Result<()> {
        self.region.write_at(offset, &[value])
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.region.read_at(offset, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn write_u16(&self, offset: usize, value: u16) -> Result<()> {
        self.region.write_at(offset, &value.to_le_bytes())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.region.read_at(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.region.write_at(offset, &value.to_le_bytes())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.region.read_at(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.region.write_at(offset, &value.to_le_bytes())
    }

    pub fn read_f64(&self, offset: usize) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64(offset)?))
    }

    pub fn write_f64(&self, offset: usize, value: f64) -> Result<()> {
        self.write_u64(offset, value.to_bits())
    }

    /// Read a NUL-padded string slot
    pub fn read_str(&self, offset: usize, width: usize) -> Result<String> {
        let mut raw = vec![0u8; width];
        self.region.read_at(offset, &mut raw)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        raw.truncate(end);
        String::from_utf8(raw).map_err(|_| {
            ScratchpadError::Deserialization(format!("header string at offset {} is not UTF-8", offset))
        })
    }

    /// Overwrite a string slot, padding with NULs
    pub fn write_str(&self, offset: usize, width: usize, value: &str) -> Result<()> {
        if value.len() > width || value.contains('\0') {
            return Err(ScratchpadError::Value(format!(
                "{:?} does not fit a {}-byte header slot",
                value, width
            )));
        }
        let mut raw = vec![0u8; width];
        raw[..value.len()].copy_from_slice(value.as_bytes());
        self.region.write_at(offset, &raw)
    }

    fn read_size(&self, offset: usize) -> Result<usize> {
        let value = self.read_u64(offset)?;
        usize::try_from(value).map_err(|_| {
            ScratchpadError::Deserialization(format!("header size {} does not fit this platform", value))
        })
    }
}

impl fmt::Debug for HeaderList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderList")
            .field("name", &self.name())
            .field("kind", &self.kind().ok())
            .field("data_name", &self.data_name().ok())
            .field("logical_size", &self.logical_size().ok())
            .field("capacity", &self.capacity().ok())
            .finish()
    }
}

const _: () = assert!(slot::MAGIC >= LOCK_AREA_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegmentManager;
    use scratchpad_core::ScratchpadConfig;

    fn fields() -> HeaderFields {
        HeaderFields {
            kind: ContainerKind::Vector,
            data_name: "scp_data".to_string(),
            logical_size: 8,
            capacity: 16,
            lock_name: None,
        }
    }

    #[test]
    fn test_slot_layout() {
        assert_eq!(slot::DATA_NAME + slot::DATA_NAME_WIDTH, slot::LOGICAL_SIZE);
        assert_eq!(slot::LOCK_NAME + slot::LOCK_NAME_WIDTH, slot::EXTENSION);
        assert_eq!(slot::EXTENSION_WIDTH, 224);
    }

    #[test]
    fn test_header_round_trip() {
        let manager = SegmentManager::new(ScratchpadConfig::default());
        let header = manager.create_header_list(&fields()).unwrap();
        assert_eq!(header.kind().unwrap(), ContainerKind::Vector);
        assert_eq!(header.data_name().unwrap(), "scp_data");
        assert_eq!(header.logical_size().unwrap(), 8);
        assert_eq!(header.capacity().unwrap(), 16);
        assert_eq!(header.lock_name().unwrap(), None);
        assert_eq!(header.epoch().unwrap(), 0);
        assert!(!header.is_destroyed().unwrap());

        let attached = manager.open_header_list(header.name()).unwrap();
        header.set_data_name("scp_next").unwrap();
        header.write_f64(slot::EXTENSION, 1.5).unwrap();
        assert_eq!(attached.bump_epoch().unwrap(), 1);
        assert_eq!(attached.data_name().unwrap(), "scp_next");
        assert_eq!(attached.read_f64(slot::EXTENSION).unwrap(), 1.5);
        assert_eq!(header.epoch().unwrap(), 1);

        manager.unlink(header.name()).unwrap();
    }

    #[test]
    fn test_string_slot_limits() {
        let manager = SegmentManager::new(ScratchpadConfig::default());
        let header = manager.create_header_list(&fields()).unwrap();
        assert!(header.set_data_name(&"n".repeat(slot::DATA_NAME_WIDTH)).is_ok());
        assert!(matches!(
            header.set_data_name(&"n".repeat(slot::DATA_NAME_WIDTH + 1)),
            Err(ScratchpadError::Value(_))
        ));
        manager.unlink(header.name()).unwrap();
    }

    #[test]
    fn test_attach_rejects_foreign_segment() {
        let manager = SegmentManager::new(ScratchpadConfig::default());
        let plain = manager.create_segment(HEADER_SIZE).unwrap();
        assert!(matches!(
            manager.open_header_list(plain.name()),
            Err(ScratchpadError::Type(_))
        ));
        manager.unlink(plain.name()).unwrap();
    }

    #[test]
    fn test_destroyed_flag() {
        let manager = SegmentManager::new(ScratchpadConfig::default());
        let header = manager.create_header_list(&fields()).unwrap();
        header.mark_destroyed().unwrap();
        assert!(header.is_destroyed().unwrap());
        manager.unlink(header.name()).unwrap();
    }
}
