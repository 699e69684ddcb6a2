//! NVMe controller attach, queue-pair command submission, and the
//! per-namespace block cache.

use alloc::vec::Vec;

use kcore::addr::PhysAddr;
use kcore::errno::Errno;
use kcore::sync::SpinLock;
use kcore::{kdebug, kinfo, kwarn};
use kmm::pmm::Pmm;

use crate::block::BlockDevice;

const PAGE_SIZE: u64 = 4096;

mod regs {
    pub const CAP: u64 = 0x00;
    pub const VS: u64 = 0x08;
    pub const INTMS: u64 = 0x0C;
    pub const CC: u64 = 0x14;
    pub const CSTS: u64 = 0x1C;
    pub const AQA: u64 = 0x24;
    pub const ASQ: u64 = 0x28;
    pub const ACQ: u64 = 0x30;
    pub const DOORBELL_BASE: u64 = 0x1000;
}

const CC_EN: u32 = 1 << 0;
const CC_CSS_NVM: u32 = 0 << 4;
const CC_MPS_4K: u32 = 0 << 7;
const CC_AMS_RR: u32 = 0 << 11;
const CC_IOSQES: u32 = 6 << 16;
const CC_IOCQES: u32 = 4 << 20;
const CSTS_RDY: u32 = 1 << 0;
const CSTS_CFS: u32 = 1 << 1;

const OP_DELETE_IO_SQ: u8 = 0x00;
const OP_CREATE_IO_SQ: u8 = 0x01;
const OP_DELETE_IO_CQ: u8 = 0x04;
const OP_CREATE_IO_CQ: u8 = 0x05;
const OP_IDENTIFY: u8 = 0x06;
const OP_SET_FEATURES: u8 = 0x09;
const OP_WRITE: u8 = 0x01;
const OP_READ: u8 = 0x02;

const CNS_NAMESPACE: u32 = 0x00;
const CNS_CONTROLLER: u32 = 0x01;
const CNS_ACTIVE_NAMESPACE_LIST: u32 = 0x02;
const FID_NUMBER_OF_QUEUES: u32 = 0x07;

const SPIN_ITERATIONS: u32 = 2_000_000;

/// One 64-byte NVMe submission queue entry.
#[repr(C)]
#[derive(Clone, Copy)]
struct NvmeCommand {
    opcode: u8,
    flags: u8,
    command_id: u16,
    nsid: u32,
    _reserved: [u32; 2],
    metadata: u64,
    prp1: u64,
    prp2: u64,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
}

impl NvmeCommand {
    const fn zeroed() -> Self {
        Self {
            opcode: 0,
            flags: 0,
            command_id: 0,
            nsid: 0,
            _reserved: [0; 2],
            metadata: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }
}

/// One 16-byte NVMe completion queue entry.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct NvmeCompletion {
    result: u32,
    _reserved: u32,
    sq_head: u16,
    sq_id: u16,
    command_id: u16,
    status: u16,
}

impl NvmeCompletion {
    const fn zeroed() -> Self {
        Self {
            result: 0,
            _reserved: 0,
            sq_head: 0,
            sq_id: 0,
            command_id: 0,
            status: 0,
        }
    }

    fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    fn status_code(&self) -> u16 {
        (self.status >> 1) & 0x7FFF
    }
}

/// Errors returned from controller attach and command submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    /// Ran out of physical frames while setting up queues or buffers.
    OutOfMemory,
    /// The controller did not reach the expected CSTS.RDY state in time.
    ControllerTimeout,
    /// CSTS.CFS (controller fatal status) was set.
    ControllerFatal,
    /// A command's completion never arrived within the polling budget.
    CommandTimeout,
    /// A command completed with a non-zero status code.
    CommandFailed(u16),
}

impl From<NvmeError> for Errno {
    fn from(e: NvmeError) -> Self {
        match e {
            NvmeError::OutOfMemory => Errno::ENoMem,
            _ => Errno::EIo,
        }
    }
}

/// Selects PRP1/PRP2 per the read/write PRP table: small transfers point
/// straight at the buffer, two-page transfers use PRP2 for the second
/// page, and anything larger points PRP2 at a PRP list region whose
/// entries this function also fills in.
fn select_prp(buf_phys: PhysAddr, byte_len: usize, prp_list: &mut [u64]) -> (u64, u64) {
    let page_off = buf_phys.as_u64() & (PAGE_SIZE - 1);
    let total = byte_len as u64;
    if total <= PAGE_SIZE - page_off {
        return (buf_phys.as_u64(), 0);
    }
    if total <= 2 * PAGE_SIZE - page_off {
        let base = buf_phys.as_u64() & !(PAGE_SIZE - 1);
        return (buf_phys.as_u64(), base + PAGE_SIZE);
    }
    let first_page_bytes = PAGE_SIZE - page_off;
    let remaining = total - first_page_bytes;
    let extra_pages = remaining.div_ceil(PAGE_SIZE) as usize;
    let base = buf_phys.as_u64() & !(PAGE_SIZE - 1);
    for (k, entry) in prp_list.iter_mut().take(extra_pages).enumerate() {
        *entry = base + (k as u64 + 1) * PAGE_SIZE;
    }
    (buf_phys.as_u64(), prp_list.as_ptr() as u64)
}

/// A submission/completion queue pair: one admin pair per controller, one
/// IO pair per namespace.
struct QueuePair {
    mmio_base: u64,
    hhdm_offset: u64,
    doorbell_stride: u32,
    qid: u16,
    slots: u16,
    submit_phys: PhysAddr,
    completion_phys: PhysAddr,
    sq_tail: u16,
    cq_head: u16,
    cq_phase: bool,
    next_cmdid: u16,
}

impl QueuePair {
    fn submit_ptr(&self) -> *mut NvmeCommand {
        (self.hhdm_offset + self.submit_phys.as_u64()) as *mut NvmeCommand
    }

    fn completion_ptr(&self) -> *const NvmeCompletion {
        (self.hhdm_offset + self.completion_phys.as_u64()) as *const NvmeCompletion
    }

    fn ring_submit_doorbell(&self) {
        let offset = regs::DOORBELL_BASE + (2 * self.qid as u64) * self.doorbell_stride as u64;
        // SAFETY: the doorbell register lies within the mapped BAR0 window.
        unsafe { core::ptr::write_volatile((self.mmio_base + offset) as *mut u32, self.sq_tail as u32) };
    }

    fn ring_completion_doorbell(&self) {
        let offset = regs::DOORBELL_BASE + (2 * self.qid as u64 + 1) * self.doorbell_stride as u64;
        // SAFETY: see `ring_submit_doorbell`.
        unsafe { core::ptr::write_volatile((self.mmio_base + offset) as *mut u32, self.cq_head as u32) };
    }

    /// Submits `cmd`, rings the doorbell, and polls for completion exactly
    /// per the five-step submission algorithm: assign cid, write+advance
    /// tail, poll the phase bit, advance+flip head, ring the completion
    /// doorbell.
    fn await_submit(&mut self, mut cmd: NvmeCommand) -> Result<NvmeCompletion, NvmeError> {
        cmd.command_id = self.next_cmdid;
        self.next_cmdid = self.next_cmdid.wrapping_add(1);

        // SAFETY: `sq_tail` is always < `slots`, kept in-bounds by the
        // modular increment below, and the ring is sized for `slots` entries.
        unsafe { self.submit_ptr().add(self.sq_tail as usize).write_volatile(cmd) };
        self.sq_tail = (self.sq_tail + 1) % self.slots;
        self.ring_submit_doorbell();

        for _ in 0..SPIN_ITERATIONS {
            // SAFETY: see the write above; the completion ring is sized
            // identically and `cq_head` stays in-bounds the same way.
            let cqe = unsafe { self.completion_ptr().add(self.cq_head as usize).read_volatile() };
            if cqe.phase() == self.cq_phase {
                self.cq_head = (self.cq_head + 1) % self.slots;
                if self.cq_head == 0 {
                    self.cq_phase = !self.cq_phase;
                }
                self.ring_completion_doorbell();
                let sc = cqe.status_code();
                if sc != 0 {
                    return Err(NvmeError::CommandFailed(sc));
                }
                return Ok(cqe);
            }
            core::hint::spin_loop();
        }
        Err(NvmeError::CommandTimeout)
    }
}

fn mmio_read32(base: u64, offset: u64) -> u32 {
    // SAFETY: `base` is the HHDM-mapped BAR0 window installed by `attach`.
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

fn mmio_write32(base: u64, offset: u64, value: u32) {
    // SAFETY: see `mmio_read32`.
    unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) };
}

fn mmio_read64(base: u64, offset: u64) -> u64 {
    let lo = mmio_read32(base, offset) as u64;
    let hi = mmio_read32(base, offset + 4) as u64;
    lo | (hi << 32)
}

fn mmio_write64(base: u64, offset: u64, value: u64) {
    mmio_write32(base, offset, value as u32);
    mmio_write32(base, offset + 4, (value >> 32) as u32);
}

fn alloc_queue_pages(pmm: &Pmm, hhdm_offset: u64, slots: u16, entry_size: usize) -> Result<PhysAddr, NvmeError> {
    let bytes = slots as usize * entry_size;
    let pages = bytes.div_ceil(PAGE_SIZE as usize).max(1);
    // SAFETY: `hhdm_offset` is the real offset passed in by the caller;
    // the frames were just allocated and are not aliased anywhere else.
    unsafe { pmm.alloc_zeroed(pages, hhdm_offset) }.ok_or(NvmeError::OutOfMemory)
}

/// One cache slot backing a namespace's read/write path.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CacheStatus {
    Invalid,
    Ready,
    Dirty,
}

struct CacheBlock {
    buffer_phys: PhysAddr,
    block_index: Option<u64>,
    status: CacheStatus,
}

const CACHE_SLOTS: usize = 512;

/// A live NVMe namespace: its IO queue pair, cache, and geometry, exposed
/// to the rest of the kernel as a [`BlockDevice`].
pub struct Namespace {
    nsid: u32,
    lba_size: u32,
    sector_count: u64,
    io_queue: SpinLock<QueuePair>,
    cache: SpinLock<Vec<CacheBlock>>,
    overwritten: SpinLock<usize>,
    cache_block_size: u32,
    prp_list_phys: PhysAddr,
    hhdm_offset: u64,
}

impl Namespace {
    fn cache_block_lba_count(&self) -> u64 {
        (self.cache_block_size / self.lba_size) as u64
    }

    /// Finds (or evicts into) a cache slot covering `block_index`, issuing
    /// a read of the whole `cacheblocksize`-byte block when the slot isn't
    /// already `Ready`/`Dirty` for it.
    fn slot_for_read(&self, block_index: u64) -> Result<usize, NvmeError> {
        let mut cache = self.cache.lock();
        if let Some(i) = cache
            .iter()
            .position(|b| b.block_index == Some(block_index) && b.status != CacheStatus::Invalid)
        {
            return Ok(i);
        }
        let mut cursor = self.overwritten.lock();
        let idx = *cursor;
        *cursor = (*cursor + 1) % CACHE_SLOTS;
        drop(cursor);

        self.fill_block(&mut cache[idx], block_index)?;
        Ok(idx)
    }

    fn fill_block(&self, slot: &mut CacheBlock, block_index: u64) -> Result<(), NvmeError> {
        let lba_count = self.cache_block_lba_count();
        let start_lba = block_index * lba_count;
        self.submit_rw(OP_READ, start_lba, lba_count as u32, slot.buffer_phys, self.cache_block_size as usize)?;
        slot.block_index = Some(block_index);
        slot.status = CacheStatus::Ready;
        Ok(())
    }

    fn submit_rw(&self, opcode: u8, start_lba: u64, lba_count: u32, buf_phys: PhysAddr, byte_len: usize) -> Result<(), NvmeError> {
        let page_off = buf_phys.as_u64() & (PAGE_SIZE - 1);
        let (prp1, prp2) = if byte_len as u64 <= 2 * PAGE_SIZE - page_off {
            select_prp(buf_phys, byte_len, &mut [])
        } else {
            // Spill the PRP list into this namespace's dedicated region —
            // it's safe to reuse across calls because `io_queue`'s lock
            // serializes every command this namespace submits.
            let mut list = [0u64; 512];
            let (p1, _) = select_prp(buf_phys, byte_len, &mut list);
            // SAFETY: `prp_list_phys` is a dedicated page reserved at
            // namespace creation and is only touched here.
            let ptr = (self.hhdm_offset + self.prp_list_phys.as_u64()) as *mut u64;
            let extra_pages = (byte_len as u64 - (PAGE_SIZE - page_off)).div_ceil(PAGE_SIZE) as usize;
            unsafe {
                core::ptr::copy_nonoverlapping(list.as_ptr(), ptr, extra_pages);
            }
            (p1, self.prp_list_phys.as_u64())
        };

        let mut cmd = NvmeCommand::zeroed();
        cmd.opcode = opcode;
        cmd.nsid = self.nsid;
        cmd.prp1 = prp1;
        cmd.prp2 = prp2;
        cmd.cdw10 = start_lba as u32;
        cmd.cdw11 = (start_lba >> 32) as u32;
        cmd.cdw12 = lba_count - 1;

        self.io_queue.lock().await_submit(cmd)?;
        Ok(())
    }
}

impl BlockDevice for Namespace {
    fn block_size(&self) -> u32 {
        self.lba_size
    }

    fn size_bytes(&self) -> u64 {
        self.sector_count * self.lba_size as u64
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let block_bytes = self.cache_block_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block_index = pos / block_bytes;
            let within = (pos % block_bytes) as usize;
            let n = (block_bytes as usize - within).min(buf.len() - done);

            let slot_idx = self.slot_for_read(block_index).map_err(Errno::from)?;
            let cache = self.cache.lock();
            let slot = &cache[slot_idx];
            // SAFETY: `buffer_phys` is HHDM-mapped and owned exclusively by
            // this cache slot.
            let src = (self.hhdm_offset + slot.buffer_phys.as_u64()) as *const u8;
            unsafe {
                core::ptr::copy_nonoverlapping(src.add(within), buf[done..done + n].as_mut_ptr(), n);
            }
            done += n;
        }
        Ok(done)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        let block_bytes = self.cache_block_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block_index = pos / block_bytes;
            let within = (pos % block_bytes) as usize;
            let n = (block_bytes as usize - within).min(buf.len() - done);

            let slot_idx = self.slot_for_read(block_index).map_err(Errno::from)?;
            {
                let mut cache = self.cache.lock();
                let slot = &mut cache[slot_idx];
                // SAFETY: see `read`.
                let dst = (self.hhdm_offset + slot.buffer_phys.as_u64()) as *mut u8;
                unsafe {
                    core::ptr::copy_nonoverlapping(buf[done..done + n].as_ptr(), dst.add(within), n);
                }
                slot.status = CacheStatus::Dirty;
            }
            // Write-through: flush the whole block back immediately so a
            // write always leaves the on-disk block equal to the cache.
            let lba_count = self.cache_block_lba_count();
            let buffer_phys = self.cache.lock()[slot_idx].buffer_phys;
            self.submit_rw(OP_WRITE, block_index * lba_count, lba_count as u32, buffer_phys, self.cache_block_size as usize)
                .map_err(Errno::from)?;
            self.cache.lock()[slot_idx].status = CacheStatus::Ready;
            done += n;
        }
        Ok(done)
    }
}

/// An attached NVMe controller: owns the admin queue pair and the MMIO
/// window, and mints [`Namespace`]s on request.
pub struct Controller {
    mmio_base: u64,
    hhdm_offset: u64,
    doorbell_stride: u32,
    admin_queue: SpinLock<QueuePair>,
    mdts_shift: u8,
}

impl Controller {
    /// Attaches to a controller whose BAR0 has already been mapped at
    /// `mmio_virt` (HHDM-relative) — the PCI class/subclass/prog-if match
    /// (0x01/0x08/0x02) that triggers this call is the caller's job.
    pub fn attach(mmio_virt: u64, hhdm_offset: u64, pmm: &Pmm) -> Result<Self, NvmeError> {
        let cap = mmio_read64(mmio_virt, regs::CAP);
        let mqes = (cap & 0xFFFF) as u16 + 1;
        let dstrd = 4u32 << ((cap >> 32) & 0xF);
        kinfo!("nvme: CAP.MQES={mqes} CAP.DBSTRIDE={dstrd}");

        let cc = mmio_read32(mmio_virt, regs::CC);
        if cc & CC_EN != 0 {
            mmio_write32(mmio_virt, regs::CC, cc & !CC_EN);
            wait_for(mmio_virt, false)?;
        }

        let admin_slots = mqes.min(64);
        let asq_phys = alloc_queue_pages(pmm, hhdm_offset, admin_slots, 64)?;
        let acq_phys = alloc_queue_pages(pmm, hhdm_offset, admin_slots, 16)?;

        mmio_write32(mmio_virt, regs::INTMS, 0xFFFF_FFFF);
        let aqa = ((admin_slots - 1) as u32) << 16 | (admin_slots - 1) as u32;
        mmio_write32(mmio_virt, regs::AQA, aqa);
        mmio_write64(mmio_virt, regs::ASQ, asq_phys.as_u64());
        mmio_write64(mmio_virt, regs::ACQ, acq_phys.as_u64());

        let cc_val = CC_EN | CC_CSS_NVM | CC_MPS_4K | CC_AMS_RR | CC_IOSQES | CC_IOCQES;
        mmio_write32(mmio_virt, regs::CC, cc_val);
        wait_for(mmio_virt, true)?;

        let mut admin_queue = QueuePair {
            mmio_base: mmio_virt,
            hhdm_offset,
            doorbell_stride: dstrd,
            qid: 0,
            slots: admin_slots,
            submit_phys: asq_phys,
            completion_phys: acq_phys,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: true,
            next_cmdid: 1,
        };

        let identify_phys = alloc_queue_pages(pmm, hhdm_offset, 1, PAGE_SIZE as usize)?;
        let identify_ptr = (hhdm_offset + identify_phys.as_u64()) as *const u8;

        let mut cmd = NvmeCommand::zeroed();
        cmd.opcode = OP_IDENTIFY;
        cmd.prp1 = identify_phys.as_u64();
        cmd.cdw10 = CNS_CONTROLLER;
        admin_queue.await_submit(cmd)?;
        // MDTS lives at byte 77 of the Identify Controller structure.
        // SAFETY: `identify_phys` is HHDM-mapped and exclusively ours.
        let mdts_shift = unsafe { identify_ptr.add(77).read_volatile() };

        let mut cmd = NvmeCommand::zeroed();
        cmd.opcode = OP_SET_FEATURES;
        cmd.cdw10 = FID_NUMBER_OF_QUEUES;
        cmd.cdw11 = (3 << 16) | 3; // request 4 IO SQs and 4 IO CQs (0-based)
        admin_queue.await_submit(cmd)?;

        kinfo!("nvme: controller ready, mdts_shift={mdts_shift}");

        Ok(Self {
            mmio_base: mmio_virt,
            hhdm_offset,
            doorbell_stride: dstrd,
            admin_queue: SpinLock::new(admin_queue),
            mdts_shift,
        })
    }

    /// Lists active namespace IDs (CNS=2 Identify).
    pub fn active_namespaces(&self, pmm: &Pmm) -> Result<Vec<u32>, NvmeError> {
        let identify_phys = alloc_queue_pages(pmm, self.hhdm_offset, 1, PAGE_SIZE as usize)?;
        let ptr = (self.hhdm_offset + identify_phys.as_u64()) as *const u32;

        let mut cmd = NvmeCommand::zeroed();
        cmd.opcode = OP_IDENTIFY;
        cmd.prp1 = identify_phys.as_u64();
        cmd.cdw10 = CNS_ACTIVE_NAMESPACE_LIST;
        self.admin_queue.lock().await_submit(cmd)?;

        let mut ids = Vec::new();
        for i in 0..1024usize {
            // SAFETY: `identify_phys` is a freshly mapped, exclusively
            // owned page.
            let nsid = unsafe { ptr.add(i).read_volatile() };
            if nsid == 0 {
                break;
            }
            ids.push(nsid);
        }
        Ok(ids)
    }

    /// Runs Identify Namespace (CNS=0), creates the namespace's dedicated
    /// IO queue pair (queue id = `nsid`), and allocates its 512-entry
    /// block cache.
    pub fn identify_namespace(&self, nsid: u32, pmm: &Pmm) -> Result<Namespace, NvmeError> {
        let identify_phys = alloc_queue_pages(pmm, self.hhdm_offset, 1, PAGE_SIZE as usize)?;
        let ptr = (self.hhdm_offset + identify_phys.as_u64()) as *const u8;

        let mut cmd = NvmeCommand::zeroed();
        cmd.opcode = OP_IDENTIFY;
        cmd.nsid = nsid;
        cmd.prp1 = identify_phys.as_u64();
        cmd.cdw10 = CNS_NAMESPACE;
        self.admin_queue.lock().await_submit(cmd)?;

        // SAFETY: `identify_phys` is HHDM-mapped and exclusively ours.
        let (nsze, flbas) = unsafe {
            let nsze = (ptr as *const u64).read_volatile();
            let flbas = ptr.add(26).read_volatile();
            (nsze, flbas)
        };
        let lba_format_idx = (flbas & 0x0F) as usize;
        // SAFETY: see above; the LBA format array starts at byte 128.
        let lbaf = unsafe { (ptr.add(128 + lba_format_idx * 4) as *const u32).read_volatile() };
        let lba_ds = ((lbaf >> 16) & 0xFF) as u8;
        let lba_size = if lba_ds >= 9 { 1u32 << lba_ds } else { 512 };

        let max_prps = if self.mdts_shift > 0 && self.mdts_shift as u32 > lba_ds as u32 {
            (1u64 << (self.mdts_shift as u32 - lba_ds as u32)) * lba_size as u64 / PAGE_SIZE
        } else {
            1
        };
        kdebug!("nvme: ns{nsid} lba_size={lba_size} sectors={nsze} max_prps={max_prps}");

        let io_slots = 64u16;
        let iocq_phys = alloc_queue_pages(pmm, self.hhdm_offset, io_slots, 16)?;
        let mut cmd = NvmeCommand::zeroed();
        cmd.opcode = OP_CREATE_IO_CQ;
        cmd.prp1 = iocq_phys.as_u64();
        cmd.cdw10 = ((io_slots - 1) as u32) << 16 | nsid;
        cmd.cdw11 = 1;
        self.admin_queue.lock().await_submit(cmd)?;

        let iosq_phys = alloc_queue_pages(pmm, self.hhdm_offset, io_slots, 64)?;
        let mut cmd = NvmeCommand::zeroed();
        cmd.opcode = OP_CREATE_IO_SQ;
        cmd.prp1 = iosq_phys.as_u64();
        cmd.cdw10 = ((io_slots - 1) as u32) << 16 | nsid;
        cmd.cdw11 = (nsid << 16) | 1;
        self.admin_queue.lock().await_submit(cmd)?;

        let io_queue = QueuePair {
            mmio_base: self.mmio_base,
            hhdm_offset: self.hhdm_offset,
            doorbell_stride: self.doorbell_stride,
            qid: nsid as u16,
            slots: io_slots,
            submit_phys: iosq_phys,
            completion_phys: iocq_phys,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: true,
            next_cmdid: 1,
        };

        let cache_block_size = 4 * lba_size;
        let mut cache = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            let buffer_phys = alloc_queue_pages(pmm, self.hhdm_offset, 1, cache_block_size as usize)?;
            cache.push(CacheBlock {
                buffer_phys,
                block_index: None,
                status: CacheStatus::Invalid,
            });
        }
        let prp_list_phys = alloc_queue_pages(pmm, self.hhdm_offset, 1, PAGE_SIZE as usize)?;

        Ok(Namespace {
            nsid,
            lba_size,
            sector_count: nsze,
            io_queue: SpinLock::new(io_queue),
            cache: SpinLock::new(cache),
            overwritten: SpinLock::new(0),
            cache_block_size,
            prp_list_phys,
            hhdm_offset: self.hhdm_offset,
        })
    }
}

fn wait_for(mmio_virt: u64, ready: bool) -> Result<(), NvmeError> {
    for _ in 0..SPIN_ITERATIONS {
        let csts = mmio_read32(mmio_virt, regs::CSTS);
        if csts & CSTS_CFS != 0 {
            return Err(NvmeError::ControllerFatal);
        }
        if (csts & CSTS_RDY != 0) == ready {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    kwarn!("nvme: controller did not reach ready={ready} in time");
    Err(NvmeError::ControllerTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prp_selection_single_page() {
        let mut list = [0u64; 8];
        let (p1, p2) = select_prp(PhysAddr::new(0x1000), 2048, &mut list);
        assert_eq!(p1, 0x1000);
        assert_eq!(p2, 0);
    }

    #[test]
    fn prp_selection_two_pages() {
        let mut list = [0u64; 8];
        let (p1, p2) = select_prp(PhysAddr::new(0x1000), 8192, &mut list);
        assert_eq!(p1, 0x1000);
        assert_eq!(p2, 0x2000);
    }

    #[test]
    fn prp_selection_list_region() {
        let mut list = [0u64; 8];
        let (p1, _p2) = select_prp(PhysAddr::new(0x1000), 16384, &mut list);
        assert_eq!(p1, 0x1000);
        assert_eq!(list[0], 0x2000);
        assert_eq!(list[1], 0x3000);
    }

    #[test]
    fn completion_phase_bit_decoding() {
        let mut cqe = NvmeCompletion::zeroed();
        cqe.status = 1;
        assert!(cqe.phase());
        assert_eq!(cqe.status_code(), 0);
        cqe.status = (5 << 1) | 1;
        assert_eq!(cqe.status_code(), 5);
    }
}
