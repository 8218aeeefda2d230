//! Functions that are used in a NIC initialization procedure.
//! 
//! They include filling the receive buffer pool, and creating the receive and transmit
//! descriptor rings and telling the device where they are.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate intel_ethernet;
extern crate nic_buffers;
extern crate nic_queues;


use core::sync::atomic::{fence, Ordering};
use alloc::vec::Vec;
use intel_ethernet::descriptors::{RxDescriptor, TxDescriptor};
use nic_buffers::{BufferPool, PacketBuffer, PacketBufferAllocator};
use nic_queues::{DescriptorRing, RxQueueRegisters, TxQueueRegisters};


/// Initialize the receive buffer pool from where receive buffers are taken and returned
/// 
/// # Arguments
/// * `num_rx_buffers`: number of buffers that are initially added to the pool 
/// * `rx_buffer_pool`: buffer pool to initialize
pub fn init_rx_buf_pool(num_rx_buffers: usize, rx_buffer_pool: &BufferPool) -> Result<(), &'static str> {
    for _i in 0..num_rx_buffers {
        if rx_buffer_pool.push(PacketBuffer::new()).is_err() {
            // if the pool is full, it returns an Err containing the buffer being pushed
            error!("init_rx_buf_pool(): rx buffer pool is full, cannot add rx buffer {}!", _i);
            return Err("nic rx buffer pool is full");
        }
    }

    Ok(())
}

/// Steps to create and initialize a receive descriptor queue
/// 
/// Returns the ring and the buffers lent to it, where the buffer at index `i` backs descriptor `i`.
/// On error, every buffer allocated so far is freed again and no register is written.
/// 
/// # Arguments
/// * `num_desc`: number of descriptors in the queue
/// * `allocator`: where to take receive buffers from
/// * `rxq_regs`: registers needed to set up a receive queue 
pub fn init_rx_queue<T: RxDescriptor, S: RxQueueRegisters>(
    num_desc: usize, 
    allocator: &dyn PacketBufferAllocator, 
    rxq_regs: &mut S,
) -> Result<(DescriptorRing<T>, Vec<PacketBuffer>), &'static str> {
    let mut rx_descs = DescriptorRing::<T>::new(num_desc)?;

    // now that we've created the rx descriptors, we can fill them in with initial values
    let mut rx_bufs_in_use: Vec<PacketBuffer> = Vec::with_capacity(num_desc);
    for rd in rx_descs.iter_mut() {
        let Some(rx_buf) = allocator.alloc() else {
            error!("init_rx_queue(): ran out of receive buffers after {} of {} descriptors", rx_bufs_in_use.len(), num_desc);
            for buf in rx_bufs_in_use {
                allocator.free(buf);
            }
            return Err("couldn't allocate a receive buffer for the rx ring");
        };
        rd.init(rx_buf.phys_addr());
        rx_bufs_in_use.push(rx_buf);
    }

    // the ring's contents must be visible to the device before it learns the ring's address
    fence(Ordering::SeqCst);

    let rx_desc_phys_addr = rx_descs.phys_addr();
    debug!("init_rx_queue(): phys_addr of rx_desc: {:#X}", rx_desc_phys_addr);

    // write the physical address of the rx descs ring
    rxq_regs.set_rdbal(rx_desc_phys_addr.low_u32());
    rxq_regs.set_rdbah(rx_desc_phys_addr.high_u32());

    // write the length (in total bytes) of the rx descs array
    rxq_regs.set_rdlen(rx_descs.size_in_bytes() as u32);

    // Write the head index (the first receive descriptor) and the tail index.
    // Note that the e1000 SDM states that we should set the RDT (tail index) to the index *beyond* the last receive descriptor, 
    // so if you have 8 rx descs, you will set it to 8. 
    // However, the tail records the last slot that software has handed back to the device,
    // and the slot after it is the next one software expects the device to fill.
    // Thus, we set it to one less than that, so that the first slot checked is slot 0.
    // This doesn't prevent all of the rx buffers from being used, they will still all be used fully.
    rxq_regs.set_rdh(0);
    rxq_regs.set_rdt((num_desc - 1) as u32);

    Ok((rx_descs, rx_bufs_in_use))
}

/// Steps to create and initialize a transmit descriptor queue
/// 
/// # Arguments
/// * `num_desc`: number of descriptors in the queue
/// * `txq_regs`: registers needed to set up a transmit queue
pub fn init_tx_queue<T: TxDescriptor, S: TxQueueRegisters>(num_desc: usize, txq_regs: &mut S) 
    -> Result<DescriptorRing<T>, &'static str> 
{
    let mut tx_descs = DescriptorRing::<T>::new(num_desc)?;

    // every slot starts out owned by software and empty
    for td in tx_descs.iter_mut() {
        td.init();
    }

    fence(Ordering::SeqCst);

    let tx_desc_phys_addr = tx_descs.phys_addr();
    debug!("init_tx_queue(): phys_addr of tx_desc: {:#X}", tx_desc_phys_addr);

    // write the physical address of the tx descs array
    txq_regs.set_tdbal(tx_desc_phys_addr.low_u32());
    txq_regs.set_tdbah(tx_desc_phys_addr.high_u32());

    // write the length (in total bytes) of the tx descs array
    txq_regs.set_tdlen(tx_descs.size_in_bytes() as u32);

    // write the head index and the tail index (both 0 initially because there are no tx requests yet)
    txq_regs.set_tdh(0);
    txq_regs.set_tdt(0);

    Ok(tx_descs)
}
