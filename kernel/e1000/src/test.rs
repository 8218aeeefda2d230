//! Tests that drive the e1000 driver against a simulated device:
//! a plain block of memory stands in for the register file,
//! and the tests play the hardware's role by writing descriptor status and length
//! into the rings whose addresses the driver programmed into TDBAL/TDBAH and RDBAL/RDBAH.
//! A simulated CPU stands in for the platform's interrupt masking and dispatch,
//! with each test thread acting as one CPU.

extern crate std;

use std::boxed::Box;
use std::cell::Cell;
use std::sync::{mpsc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;
use std::vec::Vec;
use intel_ethernet::descriptors::{RX_STATUS_DD, RX_STATUS_EOP, TX_CMD_EOP, TX_CMD_RS, TX_STATUS_DD};
use nic_buffers::PhysicalAddress;
use super::*;
use crate::regs::*;

// byte offsets within a legacy descriptor
const DESC_LENGTH_OFFSET: usize = 8;
const TX_DESC_CMD_OFFSET: usize = 11;
const DESC_STATUS_OFFSET: usize = 12;

#[derive(Clone, Copy)]
struct SimulatedDevice {
    base: *mut u32,
}

// the device memory is leaked, and every access to it is volatile
unsafe impl Send for SimulatedDevice {}

impl SimulatedDevice {
    fn new() -> SimulatedDevice {
        let mem = std::vec![0u32; E1000_REGISTERS_SIZE_IN_BYTES / 4].leak();
        SimulatedDevice { base: mem.as_mut_ptr() }
    }

    fn registers(&self) -> RegisterFile {
        unsafe { RegisterFile::new(self.base) }.ok().unwrap()
    }

    fn read(&self, reg: u32) -> u32 {
        self.registers().read(reg)
    }

    fn write(&self, reg: u32, value: u32) {
        self.registers().write(reg, value)
    }

    fn descriptor(&self, reg_lo: u32, reg_hi: u32, index: usize) -> *mut u8 {
        let base = (u64::from(self.read(reg_hi)) << 32) | u64::from(self.read(reg_lo));
        (base as usize + index * 16) as *mut u8
    }

    fn tx_descriptor(&self, index: usize) -> *mut u8 {
        self.descriptor(REG_TDBAL, REG_TDBAH, index)
    }

    fn rx_descriptor(&self, index: usize) -> *mut u8 {
        self.descriptor(REG_RDBAL, REG_RDBAH, index)
    }

    fn tx_status(&self, index: usize) -> u8 {
        unsafe { self.tx_descriptor(index).add(DESC_STATUS_OFFSET).read_volatile() }
    }

    fn tx_command(&self, index: usize) -> u8 {
        unsafe { self.tx_descriptor(index).add(TX_DESC_CMD_OFFSET).read_volatile() }
    }

    fn tx_length(&self, index: usize) -> u16 {
        unsafe { (self.tx_descriptor(index).add(DESC_LENGTH_OFFSET) as *mut u16).read_volatile() }
    }

    fn tx_buffer_address(&self, index: usize) -> u64 {
        unsafe { (self.tx_descriptor(index) as *mut u64).read_volatile() }
    }

    fn rx_status(&self, index: usize) -> u8 {
        unsafe { self.rx_descriptor(index).add(DESC_STATUS_OFFSET).read_volatile() }
    }

    fn rx_buffer_address(&self, index: usize) -> u64 {
        unsafe { (self.rx_descriptor(index) as *mut u64).read_volatile() }
    }

    /// Marks transmit slot `index` as sent.
    fn complete_tx(&self, index: usize) {
        unsafe { self.tx_descriptor(index).add(DESC_STATUS_OFFSET).write_volatile(TX_STATUS_DD) }
    }

    /// Writes back a received frame of `length` bytes into receive slot `index`.
    fn complete_rx(&self, index: usize, length: u16) {
        unsafe {
            let desc = self.rx_descriptor(index);
            (desc.add(DESC_LENGTH_OFFSET) as *mut u16).write_volatile(length);
            desc.add(DESC_STATUS_OFFSET).write_volatile(RX_STATUS_DD | RX_STATUS_EOP);
        }
    }
}

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = Cell::new(true);
    static INTERRUPT_PENDING: Cell<bool> = Cell::new(false);
}

fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.with(Cell::get)
}

/// Interrupt masking and dispatch for the current thread.
/// An interrupt raised while masked is held pending and delivered as soon as interrupts are re-enabled.
struct SimulatedCpu {
    nic: Once<&'static E1000Nic>,
}

impl SimulatedCpu {
    fn leaked() -> &'static SimulatedCpu {
        Box::leak(Box::new(SimulatedCpu { nic: Once::new() }))
    }

    fn raise_interrupt(&self) {
        if interrupts_enabled() {
            self.dispatch();
        } else {
            INTERRUPT_PENDING.with(|p| p.set(true));
        }
    }

    fn dispatch(&self) {
        let was_enabled = self.disable_interrupts();
        if let Some(nic) = self.nic.get() {
            nic.handle_interrupt();
        }
        if was_enabled {
            self.enable_interrupts();
        }
    }
}

impl InterruptControl for SimulatedCpu {
    fn disable_interrupts(&self) -> bool {
        INTERRUPTS_ENABLED.with(|e| e.replace(false))
    }

    fn enable_interrupts(&self) {
        INTERRUPTS_ENABLED.with(|e| e.set(true));
        if INTERRUPT_PENDING.with(|p| p.replace(false)) {
            self.dispatch();
        }
    }
}

/// A buffer pool that remembers the address of every buffer freed to it.
struct TestAllocator {
    pool: BufferPool,
    freed: StdMutex<Vec<PhysicalAddress>>,
}

impl TestAllocator {
    fn leaked(buffers: usize) -> &'static TestAllocator {
        let pool = BufferPool::new(256);
        init_rx_buf_pool(buffers, &pool).unwrap();
        Box::leak(Box::new(TestAllocator { pool, freed: StdMutex::new(Vec::new()) }))
    }

    fn freed(&self) -> Vec<PhysicalAddress> {
        self.freed.lock().unwrap().clone()
    }
}

impl PacketBufferAllocator for TestAllocator {
    fn alloc(&self) -> Option<PacketBuffer> {
        self.pool.alloc()
    }
    fn free(&self, buffer: PacketBuffer) {
        self.freed.lock().unwrap().push(buffer.phys_addr());
        self.pool.free(buffer);
    }
}

#[derive(Default)]
struct RecordingIngress {
    frames: StdMutex<Vec<PacketBuffer>>,
}

impl RecordingIngress {
    fn leaked() -> &'static RecordingIngress {
        Box::leak(Box::default())
    }

    fn lengths(&self) -> Vec<u16> {
        self.frames.lock().unwrap().iter().map(|b| b.length()).collect()
    }
}

impl NetworkIngress for RecordingIngress {
    fn net_rx(&self, buffer: PacketBuffer) {
        self.frames.lock().unwrap().push(buffer);
    }
}

fn new_nic(buffers: usize) -> (SimulatedDevice, &'static TestAllocator, &'static RecordingIngress, E1000Nic) {
    let device = SimulatedDevice::new();
    let allocator = TestAllocator::leaked(buffers);
    let ingress = RecordingIngress::leaked();
    let nic = E1000Nic::init(device.registers(), E1000_DEFAULT_MAC_ADDRESS, allocator, ingress, SimulatedCpu::leaked()).unwrap();
    (device, allocator, ingress, nic)
}

fn frame(len: usize) -> PacketBuffer {
    PacketBuffer::from_slice(&std::vec![0xEE; len]).unwrap()
}


#[test]
fn init_programs_device() {
    let device = SimulatedDevice::new();
    for i in 0..MTA_NUM_ENTRIES {
        device.write(REG_MTA + i * 4, 0xFFFF_FFFF);
    }
    let allocator = TestAllocator::leaked(32);
    let ingress = RecordingIngress::leaked();
    let nic = E1000Nic::init(device.registers(), E1000_DEFAULT_MAC_ADDRESS, allocator, ingress, SimulatedCpu::leaked()).unwrap();

    assert_ne!(device.read(REG_CTRL) & CTRL_RST, 0);
    assert_eq!(device.read(REG_IMC), 0xFFFF_FFFF);

    assert_eq!(device.read(REG_TDLEN), 256);
    assert_eq!(device.read(REG_TDH), 0);
    assert_eq!(device.read(REG_TDT), 0);
    assert_eq!(device.read(REG_RDLEN), 256);
    assert_eq!(device.read(REG_RDH), 0);
    assert_eq!(device.read(REG_RDT), 15);

    assert_eq!(device.read(REG_RAL), 0x1200_5452);
    assert_eq!(device.read(REG_RAH), 0x8000_5634);
    for i in 0..MTA_NUM_ENTRIES {
        assert_eq!(device.read(REG_MTA + i * 4), 0);
    }

    assert_eq!(device.read(REG_TCTL), 0x0004_010A);
    assert_eq!(device.read(REG_TIPG), 0x0060_200A);
    assert_eq!(device.read(REG_RCTL), 0x0400_8002);
    assert_eq!(device.read(REG_RDTR), 0);
    assert_eq!(device.read(REG_RADV), 0);
    assert_eq!(device.read(REG_IMS), INT_RX);

    let mut rx_addrs = Vec::new();
    for i in 0..E1000_NUM_TX_DESC {
        assert_eq!(device.tx_status(i), TX_STATUS_DD);
    }
    for i in 0..E1000_NUM_RX_DESC {
        assert_eq!(device.rx_status(i), 0);
        assert_ne!(device.rx_buffer_address(i), 0);
        rx_addrs.push(device.rx_buffer_address(i));
    }
    rx_addrs.sort();
    rx_addrs.dedup();
    assert_eq!(rx_addrs.len(), E1000_NUM_RX_DESC);

    assert_eq!(allocator.pool.len(), 32 - E1000_NUM_RX_DESC);
    assert_eq!(nic.mac_address(), E1000_DEFAULT_MAC_ADDRESS);
    assert_eq!(nic.statistics(), E1000Statistics::default());
}

#[test]
fn init_with_explicit_mac_address() {
    let device = SimulatedDevice::new();
    let mac = [0x02, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
    let nic = E1000Nic::init(device.registers(), mac, TestAllocator::leaked(16), RecordingIngress::leaked(), SimulatedCpu::leaked()).unwrap();
    assert_eq!(nic.mac_address(), mac);
    assert_eq!(device.read(REG_RAL), 0xADDE_0002);
    assert_eq!(device.read(REG_RAH), RAH_AV | 0xEFBE);
}

#[test]
fn init_fails_without_enough_receive_buffers() {
    let device = SimulatedDevice::new();
    let allocator = TestAllocator::leaked(5);
    let result = E1000Nic::init(device.registers(), E1000_DEFAULT_MAC_ADDRESS, allocator, RecordingIngress::leaked(), SimulatedCpu::leaked());

    assert_eq!(result.err(), Some("couldn't allocate a receive buffer for the rx ring"));
    assert_eq!(allocator.pool.len(), 5);
    // nothing was enabled
    assert_eq!(device.read(REG_RCTL), 0);
    assert_eq!(device.read(REG_TCTL), 0);
    assert_eq!(device.read(REG_IMS), 0);
}

#[test]
fn null_register_base_is_rejected() {
    let result = unsafe { RegisterFile::new(core::ptr::null_mut()) };
    assert_eq!(result.err(), Some("e1000 register base address was null"));
}

#[test]
fn transmit_fills_ring_then_reports_busy() {
    let (device, allocator, _ingress, nic) = new_nic(32);

    for i in 0..E1000_NUM_TX_DESC {
        let buffer = frame(60 + i);
        let addr = buffer.phys_addr();
        assert!(nic.transmit(buffer).is_ok(), "transmit {} failed", i);
        assert_eq!(device.tx_status(i), 0);
        assert_eq!(device.tx_command(i), TX_CMD_EOP | TX_CMD_RS);
        assert_eq!(device.tx_length(i), (60 + i) as u16);
        assert_eq!(device.tx_buffer_address(i), addr.value() as u64);
        assert_eq!(device.read(REG_TDT) as usize, (i + 1) % E1000_NUM_TX_DESC);
    }

    match nic.transmit(frame(42)) {
        Err(TransmitError::Busy(buffer)) => assert_eq!(buffer.length(), 42),
        _ => panic!("transmit on a full ring should report busy"),
    }
    assert_eq!(device.read(REG_TDT), 0);
    assert_eq!(device.tx_length(0), 60);
    assert!(allocator.freed().is_empty());

    let stats = nic.statistics();
    assert_eq!(stats.tx_packets, E1000_NUM_TX_DESC);
    assert_eq!(stats.tx_busy, 1);
}

#[test]
fn transmit_releases_completed_buffer_once() {
    let (device, allocator, _ingress, nic) = new_nic(32);

    let first = frame(60);
    let first_addr = first.phys_addr();
    assert!(nic.transmit(first).is_ok());
    for _ in 1..E1000_NUM_TX_DESC {
        assert!(nic.transmit(frame(60)).is_ok());
    }

    device.complete_tx(0);
    assert!(nic.send_packet(frame(70)).is_ok());
    assert_eq!(allocator.freed(), std::vec![first_addr]);
    assert_eq!(device.read(REG_TDT), 1);
    assert_eq!(device.tx_length(0), 70);

    // slot 1 is still owned by the device
    assert!(matches!(nic.transmit(frame(10)), Err(TransmitError::Busy(_))));
    assert_eq!(allocator.freed().len(), 1);
    assert_eq!(device.read(REG_TDT), 1);
}

#[test]
fn interrupt_delivers_received_frame() {
    let (device, allocator, ingress, nic) = new_nic(32);
    let lent = device.rx_buffer_address(0);

    device.complete_rx(0, 64);
    device.write(REG_ICR, INT_RX);
    let report = nic.handle_interrupt();

    assert_eq!(report, DrainReport { delivered: 1, exhausted: false });
    assert_eq!(device.read(REG_ICR), ICR_ACK_ALL);
    assert_eq!(device.read(REG_RDT), 0);
    assert_eq!(ingress.lengths(), std::vec![64]);
    assert_eq!(ingress.frames.lock().unwrap()[0].phys_addr().value() as u64, lent);

    // the slot went back to the device with a fresh buffer
    assert_eq!(device.rx_status(0), 0);
    assert_ne!(device.rx_buffer_address(0), lent);
    assert_eq!(allocator.pool.len(), 32 - E1000_NUM_RX_DESC - 1);

    let stats = nic.statistics();
    assert_eq!(stats.interrupts, 1);
    assert_eq!(stats.rx_packets, 1);
}

#[test]
fn interrupt_with_nothing_received_changes_nothing() {
    let (device, allocator, ingress, nic) = new_nic(32);

    assert_eq!(nic.handle_interrupt(), DrainReport::default());
    assert_eq!(device.read(REG_RDT), 15);
    assert!(ingress.lengths().is_empty());
    assert_eq!(allocator.pool.len(), 32 - E1000_NUM_RX_DESC);
}

#[test]
fn one_interrupt_drains_every_completed_slot() {
    let (device, _allocator, ingress, nic) = new_nic(64);

    device.complete_rx(0, 100);
    device.complete_rx(1, 200);
    device.complete_rx(2, 300);
    assert_eq!(nic.handle_interrupt().delivered, 3);
    assert_eq!(device.read(REG_RDT), 2);

    // wrap around the end of the ring
    for i in 3..E1000_NUM_RX_DESC {
        device.complete_rx(i, 1000 + i as u16);
    }
    device.complete_rx(0, 400);
    assert_eq!(nic.handle_interrupt().delivered, E1000_NUM_RX_DESC - 2);
    assert_eq!(device.read(REG_RDT), 0);

    let lengths = ingress.lengths();
    assert_eq!(&lengths[..3], &[100, 200, 300]);
    assert_eq!(lengths[3], 1003);
    assert_eq!(*lengths.last().unwrap(), 400);
    assert_eq!(nic.statistics().rx_packets, E1000_NUM_RX_DESC + 1);
}

#[test]
fn exhausted_allocator_leaves_slot_for_retry() {
    let (device, allocator, ingress, nic) = new_nic(E1000_NUM_RX_DESC);
    assert!(allocator.pool.is_empty());

    device.complete_rx(0, 64);
    let report = nic.handle_interrupt();
    assert_eq!(report, DrainReport { delivered: 0, exhausted: true });
    assert_eq!(device.read(REG_RDT), 15);
    assert_eq!(device.rx_status(0), RX_STATUS_DD | RX_STATUS_EOP);
    assert!(ingress.lengths().is_empty());
    assert_eq!(nic.statistics().rx_alloc_failures, 1);

    allocator.free(PacketBuffer::new());
    assert_eq!(nic.poll_receive(), 1);
    assert_eq!(device.read(REG_RDT), 0);
    assert_eq!(ingress.lengths(), std::vec![64]);
}

#[test]
fn nested_drain_returns_immediately() {
    let (device, _allocator, ingress, nic) = new_nic(32);
    device.complete_rx(0, 64);

    {
        let _in_progress = nic.rx_queue.lock();
        assert_eq!(nic.drain_received(), DrainReport::default());
        assert_eq!(nic.poll_receive(), 0);
        assert_eq!(device.read(REG_RDT), 15);
        assert!(!interrupts_enabled());
    }
    assert!(interrupts_enabled());

    assert_eq!(nic.poll_receive(), 1);
    assert_eq!(ingress.lengths(), std::vec![64]);
    assert_eq!(nic.statistics().interrupts, 0);
}

#[test]
fn queue_locks_mask_interrupts_while_held() {
    let (_device, _allocator, _ingress, nic) = new_nic(32);
    assert!(interrupts_enabled());

    let rx_queue = nic.rx_queue.lock();
    assert!(!interrupts_enabled());
    {
        let _tx_queue = nic.tx_queue.lock();
        assert!(!interrupts_enabled());
    }
    // still inside the outer critical section
    assert!(!interrupts_enabled());
    drop(rx_queue);
    assert!(interrupts_enabled());

    let held = nic.tx_queue.lock();
    assert!(nic.tx_queue.try_lock().is_none());
    assert!(!interrupts_enabled());
    drop(held);
    assert!(interrupts_enabled());
}

#[test]
fn interrupt_waits_for_a_drain_on_another_cpu() {
    let (device, _allocator, ingress, nic) = new_nic(32);
    let nic: &'static E1000Nic = Box::leak(Box::new(nic));
    device.complete_rx(0, 64);

    let (locked_tx, locked_rx) = mpsc::channel();
    let other_cpu = thread::spawn(move || {
        let in_progress = nic.rx_queue.lock();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(in_progress);
    });
    locked_rx.recv().unwrap();

    // the other CPU's drain started before the frame was noticed, so this interrupt must not skip it
    let report = nic.handle_interrupt();
    other_cpu.join().unwrap();

    assert_eq!(report, DrainReport { delivered: 1, exhausted: false });
    assert_eq!(ingress.lengths(), std::vec![64]);
    assert_eq!(device.read(REG_RDT), 0);
    assert_eq!(device.rx_status(0), 0);
}

/// An ingress that polls the NIC again from inside `net_rx`, then sends the frame back out.
struct EchoIngress {
    nic: Once<&'static E1000Nic>,
    nested_deliveries: AtomicUsize,
}

impl NetworkIngress for EchoIngress {
    fn net_rx(&self, buffer: PacketBuffer) {
        if let Some(nic) = self.nic.get() {
            self.nested_deliveries.fetch_add(nic.poll_receive(), Ordering::SeqCst);
            assert!(nic.transmit(buffer).is_ok());
        }
    }
}

/// Builds a NIC whose ingress echoes every frame, wired to a simulated CPU that dispatches its interrupts.
fn new_echo_nic() -> (SimulatedDevice, &'static SimulatedCpu, &'static EchoIngress, &'static E1000Nic) {
    let device = SimulatedDevice::new();
    let cpu = SimulatedCpu::leaked();
    let ingress: &'static EchoIngress = Box::leak(Box::new(EchoIngress {
        nic: Once::new(),
        nested_deliveries: AtomicUsize::new(0),
    }));
    let nic = E1000Nic::init(device.registers(), E1000_DEFAULT_MAC_ADDRESS, TestAllocator::leaked(32), ingress, cpu).unwrap();
    let nic: &'static E1000Nic = Box::leak(Box::new(nic));
    ingress.nic.call_once(|| nic);
    cpu.nic.call_once(|| nic);
    (device, cpu, ingress, nic)
}

#[test]
fn ingress_may_reenter_the_driver() {
    let (device, _cpu, ingress, nic) = new_echo_nic();

    device.complete_rx(0, 98);
    device.complete_rx(1, 98);
    assert_eq!(nic.handle_interrupt().delivered, 2);
    assert_eq!(ingress.nested_deliveries.load(Ordering::SeqCst), 0);
    assert_eq!(device.read(REG_RDT), 1);
    assert_eq!(device.read(REG_TDT), 2);
    assert_eq!(device.tx_length(1), 98);
    assert_eq!(nic.statistics().tx_packets, 2);
}

#[test]
fn interrupt_during_transmit_runs_after_the_transmit() {
    let (device, cpu, _ingress, nic) = new_echo_nic();

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let tx_queue = nic.tx_queue.lock();
        device.complete_rx(0, 98);
        cpu.raise_interrupt();
        // held off until the transmit queue is released
        assert_eq!(nic.statistics().interrupts, 0);
        drop(tx_queue);
        done_tx.send(nic.statistics()).unwrap();
    });
    let stats = done_rx.recv_timeout(Duration::from_secs(5))
        .expect("the interrupt handler deadlocked on the transmit queue");

    assert_eq!(stats.interrupts, 1);
    assert_eq!(stats.rx_packets, 1);
    assert_eq!(stats.tx_packets, 1);
    assert_eq!(device.read(REG_RDT), 0);
    assert_eq!(device.read(REG_TDT), 1);
    assert_eq!(device.tx_length(0), 98);
}

#[test]
fn interrupt_waits_for_a_transmit_on_another_cpu() {
    let (device, cpu, _ingress, nic) = new_echo_nic();

    let (locked_tx, locked_rx) = mpsc::channel();
    let other_cpu = thread::spawn(move || {
        let tx_queue = nic.tx_queue.lock();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(tx_queue);
    });
    locked_rx.recv().unwrap();

    device.complete_rx(0, 98);
    cpu.raise_interrupt();
    other_cpu.join().unwrap();

    assert!(interrupts_enabled());
    assert_eq!(nic.statistics().tx_packets, 1);
    assert_eq!(device.read(REG_RDT), 0);
    assert_eq!(device.read(REG_TDT), 1);
}

#[test]
fn global_driver_is_initialized_once() {
    assert!(get_e1000_nic().is_none());
    match transmit(frame(60)) {
        Err(TransmitError::Uninitialized(buffer)) => assert_eq!(buffer.length(), 60),
        _ => panic!("transmit without a NIC should fail"),
    }
    e1000_intr();

    let pool = default_rx_buffer_pool().unwrap();
    assert_eq!(pool.len(), RX_BUFFER_POOL_SIZE);
    assert!(core::ptr::eq(default_rx_buffer_pool().unwrap(), pool));
    assert_eq!(pool.len(), RX_BUFFER_POOL_SIZE);

    let device = SimulatedDevice::new();
    let ingress = RecordingIngress::leaked();
    let cpu = SimulatedCpu::leaked();
    let nic = unsafe { init_e1000(device.base, pool, ingress, cpu) }.ok().unwrap();
    assert_eq!(pool.len(), RX_BUFFER_POOL_SIZE - E1000_NUM_RX_DESC);
    assert!(core::ptr::eq(get_e1000_nic().unwrap(), nic));

    let other_device = SimulatedDevice::new();
    let second = unsafe { init_e1000(other_device.base, pool, ingress, cpu) };
    assert_eq!(second.err(), Some("e1000 NIC was already initialized"));
    assert_eq!(other_device.read(REG_RCTL), 0);

    assert!(transmit(frame(60)).is_ok());
    assert_eq!(device.read(REG_TDT), 1);

    device.complete_rx(0, 64);
    e1000_intr();
    assert_eq!(device.read(REG_ICR), ICR_ACK_ALL);
    assert_eq!(ingress.lengths(), std::vec![64]);
    assert_eq!(nic.statistics().interrupts, 1);
}
