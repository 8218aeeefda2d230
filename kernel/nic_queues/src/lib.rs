//! The transmit and receive queues of a NIC, each built around a [`DescriptorRing`]
//! that is shared with the device through DMA.
//!
//! Ownership of a ring slot is decided by its descriptor's Descriptor Done (DD) bit:
//! when set, software owns the slot and the buffer lent to it; when clear, the device does.
//! Each queue keeps a software-only table of the buffers currently lent to its slots,
//! which is the only record of those buffers' identity and lifetime.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate kernel_config;
extern crate intel_ethernet;
extern crate nic_buffers;
extern crate network_interface_card;


use core::sync::atomic::{fence, Ordering};
use alloc::{
    boxed::Box,
    vec::Vec,
};
use kernel_config::network::DESCRIPTOR_RING_LENGTH_ALIGNMENT;
use intel_ethernet::descriptors::{RxDescriptor, TxDescriptor};
use nic_buffers::{PacketBuffer, PacketBufferAllocator, PhysicalAddress};
use network_interface_card::{NetworkIngress, TransmitError};


/// The register accessors needed to set up and run one receive queue.
pub trait RxQueueRegisters {
    fn set_rdbal(&mut self, value: u32);
    fn set_rdbah(&mut self, value: u32);
    fn set_rdlen(&mut self, value: u32);
    fn set_rdh(&mut self, value: u32);
    fn set_rdt(&mut self, value: u32);
    /// Reads the receive descriptor tail, the last slot handed back to the device.
    fn rdt(&self) -> u32;
}

/// The register accessors needed to set up and run one transmit queue.
pub trait TxQueueRegisters {
    fn set_tdbal(&mut self, value: u32);
    fn set_tdbah(&mut self, value: u32);
    fn set_tdlen(&mut self, value: u32);
    fn set_tdh(&mut self, value: u32);
    fn set_tdt(&mut self, value: u32);
    /// Reads the transmit descriptor tail, the next slot software may fill.
    fn tdt(&self) -> u32;
}


/// A fixed-length circular array of hardware descriptors.
/// 
/// The ring's length and byte size are checked once, when it is created:
/// the number of descriptors is a nonzero power of two,
/// and the total byte length is a multiple of [`DESCRIPTOR_RING_LENGTH_ALIGNMENT`].
/// All indices given to a ring wrap around its length.
/// 
/// The ring does no locking of its own; the queue that owns it does.
pub struct DescriptorRing<T> {
    descs: Box<[T]>,
}

impl<T: Default> DescriptorRing<T> {
    /// Creates a ring of `num_desc` zeroed descriptors.
    pub fn new(num_desc: usize) -> Result<DescriptorRing<T>, &'static str> {
        if num_desc == 0 || !num_desc.is_power_of_two() {
            error!("DescriptorRing::new(): invalid number of descriptors: {}", num_desc);
            return Err("descriptor ring must have a nonzero power-of-two number of descriptors");
        }
        let size_in_bytes = num_desc * core::mem::size_of::<T>();
        if size_in_bytes % DESCRIPTOR_RING_LENGTH_ALIGNMENT != 0 {
            error!("DescriptorRing::new(): {} descriptors span {} bytes, not a multiple of {}", 
                num_desc, size_in_bytes, DESCRIPTOR_RING_LENGTH_ALIGNMENT
            );
            return Err("descriptor ring byte length must be a multiple of 128");
        }

        let descs: Box<[T]> = (0..num_desc).map(|_| T::default()).collect();
        Ok(DescriptorRing { descs })
    }
}

impl<T> DescriptorRing<T> {
    /// The number of descriptors in this ring.
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Always false, as a ring cannot be created without descriptors.
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Returns the index that follows `index`, wrapping around at the end of the ring.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.len()
    }

    pub fn descriptor(&self, index: usize) -> &T {
        &self.descs[index % self.len()]
    }

    pub fn descriptor_mut(&mut self, index: usize) -> &mut T {
        let len = self.len();
        &mut self.descs[index % len]
    }

    pub fn iter_mut(&mut self) -> core::slice::IterMut<'_, T> {
        self.descs.iter_mut()
    }

    /// The address of the first descriptor, which the device is given as the ring's base.
    pub fn phys_addr(&self) -> PhysicalAddress {
        PhysicalAddress::from_ptr(self.descs.as_ptr())
    }

    /// The total length of this ring in bytes, which the device is given as the ring's length.
    pub fn size_in_bytes(&self) -> usize {
        self.len() * core::mem::size_of::<T>()
    }
}


/// A struct that holds all information for a transmit queue. 
pub struct TxQueue<S: TxQueueRegisters, T: TxDescriptor> {
    /// Registers for this transmit queue
    regs: S,
    /// Transmit descriptors
    tx_descs: DescriptorRing<T>,
    /// The buffer lent to each slot, in which the index in the vector corresponds to the index in `tx_descs`.
    /// A buffer stays here after it is sent, until the slot is reused and its DD bit proves the device is done with it.
    tx_bufs_in_use: Vec<Option<PacketBuffer>>,
}

impl<S: TxQueueRegisters, T: TxDescriptor> TxQueue<S, T> {
    /// Creates a transmit queue over an already initialized ring.
    /// No buffers are lent to any slot.
    pub fn new(regs: S, tx_descs: DescriptorRing<T>) -> TxQueue<S, T> {
        let tx_bufs_in_use = (0..tx_descs.len()).map(|_| None).collect();
        TxQueue { regs, tx_descs, tx_bufs_in_use }
    }

    /// Places `transmit_buffer` in the slot at the transmit tail and hands it to the device.
    /// 
    /// If the device hasn't finished with that slot, nothing changes
    /// and the buffer is returned in [`TransmitError::Busy`].
    /// Otherwise the slot's previous buffer is released to `allocator`.
    pub fn send_on_queue(
        &mut self, 
        transmit_buffer: PacketBuffer, 
        allocator: &dyn PacketBufferAllocator,
    ) -> Result<(), TransmitError> {
        let tx_cur = self.regs.tdt() as usize % self.tx_descs.len();

        if !self.tx_descs.descriptor(tx_cur).descriptor_done() {
            trace!("TxQueue::send_on_queue(): slot {} still owned by device", tx_cur);
            return Err(TransmitError::Busy(transmit_buffer));
        }

        if let Some(sent) = self.reclaim(tx_cur) {
            allocator.free(sent);
        }
        self.lend(tx_cur, transmit_buffer);

        let tx_next = self.tx_descs.next_index(tx_cur);
        fence(Ordering::Release);
        self.regs.set_tdt(tx_next as u32);
        trace!("TxQueue::send_on_queue(): sent slot {}, tdt: {}", tx_cur, tx_next);
        Ok(())
    }

    /// Programs slot `index` with `buffer` and records the loan, surrendering the slot to the device.
    fn lend(&mut self, index: usize, buffer: PacketBuffer) {
        self.tx_descs.descriptor_mut(index).send(buffer.phys_addr(), buffer.length());
        self.tx_bufs_in_use[index] = Some(buffer);
    }

    fn reclaim(&mut self, index: usize) -> Option<PacketBuffer> {
        self.tx_bufs_in_use[index].take()
    }

    pub fn regs(&self) -> &S {
        &self.regs
    }

    pub fn descriptors(&self) -> &DescriptorRing<T> {
        &self.tx_descs
    }
}


/// What one pass over the receive ring accomplished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// The number of frames handed to the network ingress.
    pub delivered: usize,
    /// True if the pass stopped early because no replacement buffer could be allocated.
    /// The undrained slot is left as the device wrote it, to be retried on a later pass.
    pub exhausted: bool,
}


/// A struct that holds all information for one receive queue.
pub struct RxQueue<S: RxQueueRegisters, T: RxDescriptor> {
    /// Registers for this receive queue
    regs: S,
    /// Receive descriptors
    rx_descs: DescriptorRing<T>,
    /// The buffer lent to each slot, in which the index in the vector corresponds to the index in `rx_descs`.
    rx_bufs_in_use: Vec<Option<PacketBuffer>>,
}

impl<S: RxQueueRegisters, T: RxDescriptor> RxQueue<S, T> {
    /// Creates a receive queue over an already initialized ring,
    /// where `rx_bufs_in_use[i]` is the buffer whose address is in descriptor `i`.
    pub fn new(regs: S, rx_descs: DescriptorRing<T>, rx_bufs_in_use: Vec<PacketBuffer>) -> Result<RxQueue<S, T>, &'static str> {
        if rx_bufs_in_use.len() != rx_descs.len() {
            return Err("RxQueue::new(): there must be exactly one receive buffer per descriptor");
        }
        let rx_bufs_in_use = rx_bufs_in_use.into_iter().map(Some).collect();
        Ok(RxQueue { regs, rx_descs, rx_bufs_in_use })
    }

    /// Hands every frame the device has finished receiving to `ingress`, in ring order,
    /// refilling each drained slot with a buffer from `allocator` before returning it to the device.
    /// 
    /// Stops at the first slot the device still owns, or when no replacement buffer is available.
    pub fn drain_received(
        &mut self, 
        allocator: &dyn PacketBufferAllocator, 
        ingress: &dyn NetworkIngress,
    ) -> DrainReport {
        let mut report = DrainReport::default();

        loop {
            // the tail is the last slot we returned, so the device fills the one after it next
            let rx_cur = self.rx_descs.next_index(self.regs.rdt() as usize);

            if !self.rx_descs.descriptor(rx_cur).descriptor_done() {
                break;
            }
            if self.rx_bufs_in_use[rx_cur].is_none() {
                trace!("RxQueue::drain_received(): slot {} has no buffer", rx_cur);
                break;
            }
            fence(Ordering::Acquire);

            let new_buffer = match allocator.alloc() {
                Some(buf) => buf,
                None => {
                    warn!("RxQueue::drain_received(): no buffer to refill slot {}, leaving it for a later pass", rx_cur);
                    report.exhausted = true;
                    break;
                }
            };
            let Some(mut received) = self.reclaim(rx_cur) else {
                allocator.free(new_buffer);
                break;
            };

            let desc = self.rx_descs.descriptor(rx_cur);
            if !desc.end_of_packet() {
                debug!("RxQueue::drain_received(): slot {} holds only part of a frame", rx_cur);
            }
            let length = received.set_length_truncated(desc.length());
            trace!("RxQueue::drain_received(): slot {} received {} bytes", rx_cur, length);

            ingress.net_rx(received);
            report.delivered += 1;

            self.lend(rx_cur, new_buffer);
            fence(Ordering::Release);
            self.regs.set_rdt(rx_cur as u32);
        }

        report
    }

    /// Points slot `index` at `buffer` and records the loan, surrendering the slot to the device.
    fn lend(&mut self, index: usize, buffer: PacketBuffer) {
        let desc = self.rx_descs.descriptor_mut(index);
        desc.set_packet_address(buffer.phys_addr());
        desc.reset_status();
        self.rx_bufs_in_use[index] = Some(buffer);
    }

    fn reclaim(&mut self, index: usize) -> Option<PacketBuffer> {
        self.rx_bufs_in_use[index].take()
    }

    pub fn regs(&self) -> &S {
        &self.regs
    }

    pub fn descriptors(&self) -> &DescriptorRing<T> {
        &self.rx_descs
    }
}
