//! This file contains the struct used to access the e1000's memory-mapped registers,
//! and the register offsets and configuration values written to them.
//! 
//! The registers are a block of 32-bit words, 128 KiB in total, addressed here by byte offset.
//! The receive and transmit queue registers are additionally wrapped in per-queue structs
//! (see `E1000RxQueueRegisters` and `E1000TxQueueRegisters`) so that the e1000
//! can use the queue code shared by all network drivers.

use core::ptr::{self, NonNull};

/// The size of the e1000's memory-mapped register region.
pub const E1000_REGISTERS_SIZE_IN_BYTES: usize = 0x20000;

/// A handle to the e1000's memory-mapped registers.
/// 
/// Every access is a volatile 32-bit read or write.
/// Copies of this handle refer to the same device registers.
#[derive(Clone, Copy)]
pub struct RegisterFile {
    base: NonNull<u32>,
}

// The register block is device memory that lives for as long as the kernel does,
// and the device itself tolerates accesses from any CPU.
unsafe impl Send for RegisterFile { }
unsafe impl Sync for RegisterFile { }

impl RegisterFile {
    /// Wraps the register block that starts at `base`.
    /// 
    /// # Safety
    /// `base` must point to the e1000's register block (or memory standing in for it),
    /// mapped for reading and writing for [`E1000_REGISTERS_SIZE_IN_BYTES`] bytes, 
    /// and must stay mapped for the rest of the program.
    pub unsafe fn new(base: *mut u32) -> Result<RegisterFile, &'static str> {
        let base = NonNull::new(base).ok_or("e1000 register base address was null")?;
        Ok(RegisterFile { base })
    }

    /// Reads the register at byte offset `reg`.
    pub fn read(&self, reg: u32) -> u32 {
        debug_assert!((reg as usize) < E1000_REGISTERS_SIZE_IN_BYTES && reg % 4 == 0);
        unsafe { ptr::read_volatile(self.base.as_ptr().add(reg as usize / 4)) }
    }

    /// Writes `value` to the register at byte offset `reg`.
    pub fn write(&self, reg: u32, value: u32) {
        debug_assert!((reg as usize) < E1000_REGISTERS_SIZE_IN_BYTES && reg % 4 == 0);
        unsafe { ptr::write_volatile(self.base.as_ptr().add(reg as usize / 4), value) }
    }
}


pub const REG_CTRL:                 u32 = 0x0000;
/// Interrupt Cause Read
pub const REG_ICR:                  u32 = 0x00C0;
/// Interrupt Mask Set/Read
pub const REG_IMS:                  u32 = 0x00D0;
/// Interrupt Mask Clear
pub const REG_IMC:                  u32 = 0x00D8;
pub const REG_RCTL:                 u32 = 0x0100;
pub const REG_TCTL:                 u32 = 0x0400;
/// Transmit Inter Packet Gap
pub const REG_TIPG:                 u32 = 0x0410;

pub const REG_RDBAL:                u32 = 0x2800;
pub const REG_RDBAH:                u32 = 0x2804;
pub const REG_RDLEN:                u32 = 0x2808;
pub const REG_RDH:                  u32 = 0x2810;
pub const REG_RDT:                  u32 = 0x2818;
/// RX Delay Timer Register
pub const REG_RDTR:                 u32 = 0x2820;
/// RX Int. Absolute Delay Timer
pub const REG_RADV:                 u32 = 0x282C;

pub const REG_TDBAL:                u32 = 0x3800;
pub const REG_TDBAH:                u32 = 0x3804;
pub const REG_TDLEN:                u32 = 0x3808;
pub const REG_TDH:                  u32 = 0x3810;
pub const REG_TDT:                  u32 = 0x3818;

/// Multicast Table Array, 128 words
pub const REG_MTA:                  u32 = 0x5200;
pub const MTA_NUM_ENTRIES:          u32 = 4096 / 32;
/// Receive Address Low: the lower 4 bytes of the station address
pub const REG_RAL:                  u32 = 0x5400;
/// Receive Address High: the upper 2 bytes of the station address, and the Address Valid bit
pub const REG_RAH:                  u32 = 0x5404;
/// Address Valid
pub const RAH_AV:                   u32 = 1 << 31;

// CTRL commands
/// Device Reset
pub const CTRL_RST:                 u32 = 1 << 26;

// RCTL commands
/// Receiver Enable
pub const RCTL_EN:                  u32 = 1 << 1;
/// Broadcast Accept Mode
pub const RCTL_BAM:                 u32 = 1 << 15;
/// Strip Ethernet CRC
pub const RCTL_SECRC:               u32 = 1 << 26;

// Buffer Sizes
pub const RCTL_BSIZE_2048:          u32 = 0 << 16;

// TCTL commands
/// Transmit Enable
pub const TCTL_EN:                  u32 = 1 << 1;
/// Pad Short Packets
pub const TCTL_PSP:                 u32 = 1 << 3;
/// Collision Threshold
pub const TCTL_CT_SHIFT:            u32 = 4;
/// Collision Distance
pub const TCTL_COLD_SHIFT:          u32 = 12;

// TIPG fields
pub const TIPG_IPGR1_SHIFT:         u32 = 10;
pub const TIPG_IPGR2_SHIFT:         u32 = 20;

/// Interrupt type: Receive Timer Interrupt (receive descriptor write-back)
pub const INT_RX:                   u32 = 0x80;
/// Writing this to ICR acknowledges every pending interrupt cause.
pub const ICR_ACK_ALL:              u32 = 0xFFFF_FFFF;
