//! MBR/GPT partition table parsing and the thin bounds-checked partition
//! device carved out of a whole-disk [`BlockDevice`].

use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::kwarn;

use crate::block::BlockDevice;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

bitflags::bitflags! {
    /// GPT partition entry attribute bits relevant to mount policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GptAttributes: u64 {
        /// Firmware should ignore this partition when building a boot menu.
        const REQUIRED_PARTITION = 1 << 0;
        /// Not to be assigned a drive letter / auto-mounted.
        const DONT_MOUNT = 1 << 2;
        /// Legacy BIOS bootable flag, carried over from MBR semantics.
        const LEGACY = 1 << 3;
    }
}

/// One discovered partition: start/length in the underlying disk's own
/// logical blocks, plus whatever identifies it to the caller.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    /// Index within the table (1-based, matching `nvme0n1pN` naming).
    pub index: u32,
    /// First logical block of the partition on the parent device.
    pub start_lba: u64,
    /// Length in logical blocks.
    pub sectors: u64,
}

/// Reads the partition table from `disk` and returns every partition that
/// should be mounted: GPT if the signature and header sanity checks pass,
/// otherwise a fallback scan of the legacy MBR.
pub fn enumerate_partitions(disk: &dyn BlockDevice) -> Result<Vec<PartitionInfo>, Errno> {
    let blksize = disk.block_size() as u64;
    let mut lba1 = alloc::vec![0u8; blksize as usize];
    disk.read(blksize, &mut lba1)?;

    if lba1.len() >= 8 && &lba1[0..8] == GPT_SIGNATURE {
        if let Some(partitions) = try_parse_gpt(disk, &lba1, blksize)? {
            return Ok(partitions);
        }
        kwarn!("storage: GPT signature present but header failed sanity checks, falling back to MBR");
    }
    parse_mbr(disk, blksize)
}

fn try_parse_gpt(disk: &dyn BlockDevice, header: &[u8], blksize: u64) -> Result<Option<Vec<PartitionInfo>>, Errno> {
    let header_size = u32::from_le_bytes(header[12..16].try_into().unwrap()) as u64;
    let my_lba = u64::from_le_bytes(header[24..32].try_into().unwrap());
    let first_usable = u64::from_le_bytes(header[40..48].try_into().unwrap());
    let last_usable = u64::from_le_bytes(header[48..56].try_into().unwrap());
    let entries_lba = u64::from_le_bytes(header[72..80].try_into().unwrap());
    let entry_count = u32::from_le_bytes(header[80..84].try_into().unwrap());
    let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap()) as u64;

    let disk_blocks = disk.size_bytes() / blksize;
    if header_size < 92 || header_size as u64 > blksize || my_lba != 1 || first_usable > last_usable || entry_size == 0 {
        return Ok(None);
    }
    if entries_lba.saturating_mul(blksize) >= disk.size_bytes() || last_usable > disk_blocks {
        return Ok(None);
    }

    let entries_bytes = entry_count as u64 * entry_size;
    let mut entries_buf = alloc::vec![0u8; entries_bytes as usize];
    disk.read(entries_lba * blksize, &mut entries_buf)?;

    let mut out = Vec::new();
    for i in 0..entry_count as u64 {
        let off = (i * entry_size) as usize;
        let Some(entry) = entries_buf.get(off..off + entry_size as usize) else {
            break;
        };
        // A null type GUID (all-zero) marks an unused entry.
        if entry[0..16].iter().all(|&b| b == 0) {
            continue;
        }
        let start_lba = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        let end_lba = u64::from_le_bytes(entry[40..48].try_into().unwrap());
        let attrs = GptAttributes::from_bits_truncate(u64::from_le_bytes(entry[48..56].try_into().unwrap()));
        if attrs.intersects(GptAttributes::DONT_MOUNT | GptAttributes::LEGACY) {
            continue;
        }
        if end_lba < start_lba {
            continue;
        }
        out.push(PartitionInfo {
            index: (i + 1) as u32,
            start_lba,
            sectors: end_lba - start_lba + 1,
        });
    }
    Ok(Some(out))
}

fn parse_mbr(disk: &dyn BlockDevice, blksize: u64) -> Result<Vec<PartitionInfo>, Errno> {
    let mut sector0 = alloc::vec![0u8; blksize as usize];
    disk.read(0, &mut sector0)?;

    let mut out = Vec::new();
    for i in 0..4u32 {
        let off = 446 + (i as usize) * 16;
        let Some(entry) = sector0.get(off..off + 16) else {
            break;
        };
        let partition_type = entry[4];
        if partition_type == 0 {
            continue;
        }
        let start_lba = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as u64;
        let sectors = u32::from_le_bytes(entry[12..16].try_into().unwrap()) as u64;
        out.push(PartitionInfo {
            index: i + 1,
            start_lba,
            sectors,
        });
    }
    Ok(out)
}

/// A bounds-checked view of `[start_lba, start_lba + sectors)` on a parent
/// [`BlockDevice`], delegating every read/write at the remapped offset.
pub struct PartitionDevice {
    parent: Arc<dyn BlockDevice>,
    start_byte: u64,
    size_bytes: u64,
    block_size: u32,
}

impl PartitionDevice {
    /// Wraps `info`'s range of `parent` as a standalone block device.
    pub fn new(parent: Arc<dyn BlockDevice>, info: &PartitionInfo) -> Self {
        let block_size = parent.block_size();
        Self {
            start_byte: info.start_lba * block_size as u64,
            size_bytes: info.sectors * block_size as u64,
            block_size,
            parent,
        }
    }
}

impl BlockDevice for PartitionDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        if offset.saturating_add(buf.len() as u64) > self.size_bytes {
            return Err(Errno::EInval);
        }
        self.parent.read(self.start_byte + offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        if offset.saturating_add(buf.len() as u64) > self.size_bytes {
            return Err(Errno::EInval);
        }
        self.parent.write(self.start_byte + offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcore::sync::SpinLock;

    struct FakeDisk {
        data: SpinLock<Vec<u8>>,
        block_size: u32,
    }

    impl BlockDevice for FakeDisk {
        fn block_size(&self) -> u32 {
            self.block_size
        }
        fn size_bytes(&self) -> u64 {
            self.data.lock().len() as u64
        }
        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
            let data = self.data.lock();
            let off = offset as usize;
            buf.copy_from_slice(&data[off..off + buf.len()]);
            Ok(buf.len())
        }
        fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
            let mut data = self.data.lock();
            let off = offset as usize;
            data[off..off + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn mbr_disk() -> FakeDisk {
        let mut data = alloc::vec![0u8; 4096 * 4];
        let off = 446;
        data[off + 4] = 0x83; // Linux partition type
        data[off + 8..off + 12].copy_from_slice(&2048u32.to_le_bytes());
        data[off + 12..off + 16].copy_from_slice(&2048u32.to_le_bytes());
        FakeDisk {
            data: SpinLock::new(data),
            block_size: 512,
        }
    }

    #[test]
    fn mbr_fallback_reads_one_partition() {
        let disk = mbr_disk();
        let parts = enumerate_partitions(&disk).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start_lba, 2048);
        assert_eq!(parts[0].sectors, 2048);
    }

    #[test]
    fn partition_device_bounds_check() {
        let disk = Arc::new(mbr_disk());
        let info = PartitionInfo {
            index: 1,
            start_lba: 1,
            sectors: 4,
        };
        let part = PartitionDevice::new(disk, &info);
        let mut buf = [0u8; 512];
        assert!(part.read(0, &mut buf).is_ok());
        assert_eq!(part.read(4 * 512, &mut buf).unwrap_err(), Errno::EInval);
    }
}
