//! Driver for the Intel e1000 ethernet NIC, as emulated by QEMU, Bochs and VirtualBox.
//!
//! The driver owns one transmit ring and one receive ring, each shared with the device through DMA.
//! Packets are sent synchronously with [`transmit`]; received packets are drained from the receive ring
//! by the interrupt handler [`e1000_intr`] and handed to the network stack's [`NetworkIngress`].
//!
//! The device's registers must already be mapped (and the device discovered on the PCI bus)
//! before [`init_e1000`] is called with their base address.
//! Both rings are locked with interrupts masked, through the platform's [`InterruptControl`].

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
extern crate spin;
extern crate kernel_config;
extern crate intel_ethernet;
extern crate nic_buffers;
extern crate nic_queues;
extern crate nic_initialization;
extern crate network_interface_card;

pub mod regs;
pub mod irq;
use regs::*;
use irq::MutexIrqSafeGuard;
pub use irq::{InterruptControl, MutexIrqSafe};

#[cfg(test)]
mod test;

use core::sync::atomic::{fence, AtomicUsize, Ordering};
use spin::{Mutex, Once};
use kernel_config::network::{
    E1000_DEFAULT_MAC_ADDRESS, E1000_NUM_RX_DESC, E1000_NUM_TX_DESC, 
    E1000_TIPG_IPGR1, E1000_TIPG_IPGR2, E1000_TIPG_IPGT, 
    E1000_TX_COLLISION_DISTANCE, E1000_TX_COLLISION_THRESHOLD, 
    PACKET_BUFFER_SIZE_IN_BYTES, RX_BUFFER_POOL_SIZE,
};
use intel_ethernet::descriptors::{LegacyRxDescriptor, LegacyTxDescriptor};
use nic_buffers::{BufferPool, PacketBuffer, PacketBufferAllocator};
use nic_queues::{DrainReport, RxQueue, RxQueueRegisters, TxQueue, TxQueueRegisters};
use nic_initialization::{init_rx_buf_pool, init_rx_queue, init_tx_queue};
use network_interface_card::{NetworkIngress, NetworkInterfaceCard, TransmitError};

// RCTL is programmed with RCTL_BSIZE_2048, so every receive buffer must be exactly that large.
const_assert_eq!(PACKET_BUFFER_SIZE_IN_BYTES, 2048);
const_assert!(E1000_NUM_TX_DESC * 16 % 128 == 0);
const_assert!(E1000_NUM_RX_DESC * 16 % 128 == 0);


/// The single instance of the E1000 NIC.
static E1000_NIC: Once<E1000Nic> = Once::new();
/// Serializes calls to `init_e1000()`, so the device is only ever initialized once.
static E1000_INIT_LOCK: Mutex<()> = Mutex::new(());

/// Returns a reference to the E1000Nic, if it exists and has been initialized.
pub fn get_e1000_nic() -> Option<&'static E1000Nic> {
    E1000_NIC.get()
}

/// Initializes the e1000 NIC whose registers are mapped at `register_base`,
/// configured with the default station address, and makes it available through [`get_e1000_nic`].
/// 
/// Returns an error if the NIC was already initialized, in which case the existing NIC is untouched.
/// 
/// # Safety
/// `register_base` must point to the e1000's mapped register block, as described in [`RegisterFile::new`].
pub unsafe fn init_e1000(
    register_base: *mut u32,
    allocator: &'static dyn PacketBufferAllocator,
    ingress: &'static dyn NetworkIngress,
    irq: &'static dyn InterruptControl,
) -> Result<&'static E1000Nic, &'static str> {
    let _guard = E1000_INIT_LOCK.lock();
    if E1000_NIC.is_completed() {
        return Err("e1000 NIC was already initialized");
    }
    let regs = RegisterFile::new(register_base)?;
    let nic = E1000Nic::init(regs, E1000_DEFAULT_MAC_ADDRESS, allocator, ingress, irq)?;
    Ok(E1000_NIC.call_once(|| nic))
}

/// Sends `buffer` through the e1000 NIC.
/// 
/// Returns the buffer inside an error if the transmit ring is full or the NIC hasn't been initialized.
pub fn transmit(buffer: PacketBuffer) -> Result<(), TransmitError> {
    match get_e1000_nic() {
        Some(nic) => nic.transmit(buffer),
        None => Err(TransmitError::Uninitialized(buffer)),
    }
}

/// The e1000's interrupt handler, to be invoked by the platform's interrupt dispatch.
pub fn e1000_intr() {
    if let Some(nic) = get_e1000_nic() {
        nic.handle_interrupt();
    } else {
        error!("BUG: e1000_intr(): E1000 NIC hasn't yet been initialized!");
    }
}


/// The pool of preallocated receive buffers that the e1000 can use as its allocator.
static RX_BUFFER_POOL: BufferPool = BufferPool::new(RX_BUFFER_POOL_SIZE);
static RX_BUFFER_POOL_FILLED: Once<Result<(), &'static str>> = Once::new();

/// Returns the default packet buffer pool, filling it with `RX_BUFFER_POOL_SIZE` buffers on first use.
pub fn default_rx_buffer_pool() -> Result<&'static BufferPool, &'static str> {
    RX_BUFFER_POOL_FILLED.call_once(|| init_rx_buf_pool(RX_BUFFER_POOL_SIZE, &RX_BUFFER_POOL)).clone()?;
    Ok(&RX_BUFFER_POOL)
}


/// A struct which contains the receive queue registers and implements the `RxQueueRegisters` trait,
/// which is required to store the registers in an `RxQueue` object.
pub struct E1000RxQueueRegisters(RegisterFile);

impl RxQueueRegisters for E1000RxQueueRegisters {
    fn set_rdbal(&mut self, value: u32) {
        self.0.write(REG_RDBAL, value);
    }
    fn set_rdbah(&mut self, value: u32) {
        self.0.write(REG_RDBAH, value);
    }
    fn set_rdlen(&mut self, value: u32) {
        self.0.write(REG_RDLEN, value);
    }
    fn set_rdh(&mut self, value: u32) {
        self.0.write(REG_RDH, value);
    }
    fn set_rdt(&mut self, value: u32) {
        self.0.write(REG_RDT, value);
    }
    fn rdt(&self) -> u32 {
        self.0.read(REG_RDT)
    }
}

/// A struct which contains the transmit queue registers and implements the `TxQueueRegisters` trait,
/// which is required to store the registers in a `TxQueue` object.
pub struct E1000TxQueueRegisters(RegisterFile);

impl TxQueueRegisters for E1000TxQueueRegisters {
    fn set_tdbal(&mut self, value: u32) {
        self.0.write(REG_TDBAL, value);
    }
    fn set_tdbah(&mut self, value: u32) {
        self.0.write(REG_TDBAH, value);
    }
    fn set_tdlen(&mut self, value: u32) {
        self.0.write(REG_TDLEN, value);
    }
    fn set_tdh(&mut self, value: u32) {
        self.0.write(REG_TDH, value);
    }
    fn set_tdt(&mut self, value: u32) {
        self.0.write(REG_TDT, value);
    }
    fn tdt(&self) -> u32 {
        self.0.read(REG_TDT)
    }
}


/// Counters of the e1000 driver's activity, readable with [`E1000Nic::statistics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct E1000Statistics {
    /// Packets handed to the device for transmission.
    pub tx_packets: usize,
    /// Transmit attempts refused because the transmit ring was full.
    pub tx_busy: usize,
    /// Received frames delivered to the network ingress.
    pub rx_packets: usize,
    /// Receive drains cut short because no replacement buffer could be allocated.
    pub rx_alloc_failures: usize,
    /// Interrupts handled.
    pub interrupts: usize,
}

#[derive(Default)]
struct Counters {
    tx_packets: AtomicUsize,
    tx_busy: AtomicUsize,
    rx_packets: AtomicUsize,
    rx_alloc_failures: AtomicUsize,
    interrupts: AtomicUsize,
}


/// Struct representing an e1000 network interface card.
pub struct E1000Nic {
    /// memory-mapped control registers
    regs: RegisterFile,
    /// Transmit queue with descriptors
    tx_queue: MutexIrqSafe<TxQueue<E1000TxQueueRegisters, LegacyTxDescriptor>>,
    /// Receive queue with descriptors
    rx_queue: MutexIrqSafe<RxQueue<E1000RxQueueRegisters, LegacyRxDescriptor>>,
    /// Where receive buffers come from, and where sent transmit buffers go back to.
    allocator: &'static dyn PacketBufferAllocator,
    /// Where received frames are delivered.
    ingress: &'static dyn NetworkIngress,
    stats: Counters,
}

impl NetworkInterfaceCard for E1000Nic {
    fn send_packet(&self, transmit_buffer: PacketBuffer) -> Result<(), TransmitError> {
        self.transmit(transmit_buffer)
    }

    fn poll_receive(&self) -> usize {
        self.drain_received().delivered
    }

    fn mac_address(&self) -> [u8; 6] {
        let mac_32_low = self.regs.read(REG_RAL);
        let mac_32_high = self.regs.read(REG_RAH);

        let mut mac_addr = [0; 6];
        mac_addr[0] =  mac_32_low as u8;
        mac_addr[1] = (mac_32_low >> 8) as u8;
        mac_addr[2] = (mac_32_low >> 16) as u8;
        mac_addr[3] = (mac_32_low >> 24) as u8;
        mac_addr[4] =  mac_32_high as u8;
        mac_addr[5] = (mac_32_high >> 8) as u8;
        mac_addr
    }
}


/// Functions that setup the NIC struct and handle the sending and receiving of packets.
impl E1000Nic {
    /// Resets and initializes the e1000 NIC whose registers are `regs`.
    /// 
    /// Both rings are created and handed to the device, the station address is set to `mac_addr`,
    /// and transmission, reception and the receive interrupt are enabled.
    /// Receive buffers are taken from `allocator`; received frames are delivered to `ingress`.
    /// Interrupts are masked through `irq` whenever either ring is locked.
    pub fn init(
        regs: RegisterFile,
        mac_addr: [u8; 6],
        allocator: &'static dyn PacketBufferAllocator,
        ingress: &'static dyn NetworkIngress,
        irq: &'static dyn InterruptControl,
    ) -> Result<E1000Nic, &'static str> {
        Self::reset(&regs);

        let mut tx_registers = E1000TxQueueRegisters(regs);
        let tx_descs = init_tx_queue::<LegacyTxDescriptor, _>(E1000_NUM_TX_DESC, &mut tx_registers)?;
        let tx_queue = TxQueue::new(tx_registers, tx_descs);

        let mut rx_registers = E1000RxQueueRegisters(regs);
        let (rx_descs, rx_buffers) = init_rx_queue::<LegacyRxDescriptor, _>(E1000_NUM_RX_DESC, allocator, &mut rx_registers)?;
        let rx_queue = RxQueue::new(rx_registers, rx_descs, rx_buffers)?;

        Self::set_station_address(&regs, mac_addr);
        Self::clear_multicast(&regs);
        Self::enable_transmit(&regs);
        Self::enable_receive(&regs);
        Self::enable_interrupts(&regs);

        info!("e1000 initialized, MAC address: {:02x?}", mac_addr);
        Ok(E1000Nic {
            regs,
            tx_queue: MutexIrqSafe::new(tx_queue, irq),
            rx_queue: MutexIrqSafe::new(rx_queue, irq),
            allocator,
            ingress,
            stats: Counters::default(),
        })
    }

    /// Masks all interrupts and resets the device.
    fn reset(regs: &RegisterFile) {
        regs.write(REG_IMC, 0xFFFF_FFFF);
        let ctrl = regs.read(REG_CTRL);
        regs.write(REG_CTRL, ctrl | CTRL_RST);
        // the reset may have unmasked interrupts again
        regs.write(REG_IMC, 0xFFFF_FFFF);
        fence(Ordering::SeqCst);
        debug!("e1000::reset(): REG_CTRL: {:#X}", regs.read(REG_CTRL));
    }

    /// Programs the receive address filter with the station address `mac_addr`.
    fn set_station_address(regs: &RegisterFile, mac_addr: [u8; 6]) {
        let low = u32::from_le_bytes([mac_addr[0], mac_addr[1], mac_addr[2], mac_addr[3]]);
        let high = u32::from(mac_addr[4]) | (u32::from(mac_addr[5]) << 8);
        regs.write(REG_RAL, low);
        regs.write(REG_RAH, high | RAH_AV);
    }

    fn clear_multicast(regs: &RegisterFile) {
        for i in 0..MTA_NUM_ENTRIES {
            regs.write(REG_MTA + (i * 4), 0);
        }
    }

    fn enable_transmit(regs: &RegisterFile) {
        regs.write(REG_TCTL, TCTL_EN
            | TCTL_PSP
            | (E1000_TX_COLLISION_THRESHOLD << TCTL_CT_SHIFT)
            | (E1000_TX_COLLISION_DISTANCE << TCTL_COLD_SHIFT)
        );
        regs.write(REG_TIPG, E1000_TIPG_IPGT
            | (E1000_TIPG_IPGR1 << TIPG_IPGR1_SHIFT)
            | (E1000_TIPG_IPGR2 << TIPG_IPGR2_SHIFT)
        );
        debug!("e1000::enable_transmit(): REG_TCTL: {:#X}", regs.read(REG_TCTL));
    }

    fn enable_receive(regs: &RegisterFile) {
        // accept broadcasts, and strip the CRC so only the frame reaches the buffer
        regs.write(REG_RCTL, RCTL_EN | RCTL_BAM | RCTL_BSIZE_2048 | RCTL_SECRC);
        debug!("e1000::enable_receive(): REG_RCTL: {:#X}", regs.read(REG_RCTL));
    }

    /// Enable Interrupts 
    fn enable_interrupts(regs: &RegisterFile) {
        // interrupt as soon as a frame is written back, with no delay
        regs.write(REG_RDTR, 0);
        regs.write(REG_RADV, 0);
        regs.write(REG_IMS, INT_RX);
    }

    /// Sends `buffer` on the transmit ring.
    /// 
    /// If the device hasn't finished with the next slot, the buffer is returned in [`TransmitError::Busy`]
    /// and nothing changes; the caller decides whether to drop, queue or retry it.
    pub fn transmit(&self, buffer: PacketBuffer) -> Result<(), TransmitError> {
        let result = self.tx_queue.lock().send_on_queue(buffer, self.allocator);
        match result {
            Ok(()) => self.stats.tx_packets.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.tx_busy.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// The main interrupt handling routine for the e1000 NIC.
    /// This should be invoked from the actual interrupt handler entry point.
    /// 
    /// Acknowledges all interrupt causes, then drains the receive ring,
    /// waiting for the receive queue if another CPU is draining it.
    pub fn handle_interrupt(&self) -> DrainReport {
        // the device won't raise another interrupt until this one is acknowledged
        self.regs.write(REG_ICR, ICR_ACK_ALL);
        self.stats.interrupts.fetch_add(1, Ordering::Relaxed);
        // nothing on this CPU holds the lock: it masks interrupts while held
        let rx_queue = self.rx_queue.lock();
        self.drain(rx_queue)
    }

    /// Delivers every received frame to the network ingress and returns the slots to the device.
    /// 
    /// If another drain is already in progress (e.g., the ingress is polling from inside `net_rx`),
    /// that drain is responsible for the work and this returns an empty report right away.
    pub fn drain_received(&self) -> DrainReport {
        match self.rx_queue.try_lock() {
            Some(rx_queue) => self.drain(rx_queue),
            None => {
                trace!("e1000::drain_received(): receive queue busy, skipping");
                DrainReport::default()
            }
        }
    }

    fn drain(&self, mut rx_queue: MutexIrqSafeGuard<'_, RxQueue<E1000RxQueueRegisters, LegacyRxDescriptor>>) -> DrainReport {
        let report = rx_queue.drain_received(self.allocator, self.ingress);
        drop(rx_queue);

        self.stats.rx_packets.fetch_add(report.delivered, Ordering::Relaxed);
        if report.exhausted {
            self.stats.rx_alloc_failures.fetch_add(1, Ordering::Relaxed);
        }
        report
    }

    /// Returns a snapshot of this NIC's counters.
    pub fn statistics(&self) -> E1000Statistics {
        E1000Statistics {
            tx_packets: self.stats.tx_packets.load(Ordering::Relaxed),
            tx_busy: self.stats.tx_busy.load(Ordering::Relaxed),
            rx_packets: self.stats.rx_packets.load(Ordering::Relaxed),
            rx_alloc_failures: self.stats.rx_alloc_failures.load(Ordering::Relaxed),
            interrupts: self.stats.interrupts.load(Ordering::Relaxed),
        }
    }
}
