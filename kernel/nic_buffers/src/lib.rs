//! Defines buffers that are used to send and receive packets.
//!
//! A [`PacketBuffer`] is a single-owner, fixed-capacity frame buffer.
//! The NIC driver never creates or destroys buffers on its own: it obtains them from,
//! and returns them to, a [`PacketBufferAllocator`].
//! [`BufferPool`] is the default allocator, a bounded free list of preallocated buffers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate kernel_config;
extern crate spin;


use core::{fmt, ops::{Add, Deref, DerefMut}};
use alloc::{boxed::Box, vec::Vec};
use kernel_config::network::PACKET_BUFFER_SIZE_IN_BYTES;
use spin::Mutex;


/// A bus address as seen by a DMA-capable device.
///
/// The NIC crates assume the kernel identity-maps the memory it lends to devices,
/// so the physical address of a buffer equals its virtual address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    /// Creates a new `PhysicalAddress` from a raw value.
    pub const fn new(addr: usize) -> PhysicalAddress {
        PhysicalAddress(addr)
    }

    /// Returns the bus address of the memory that `ptr` points to.
    pub fn from_ptr<T>(ptr: *const T) -> PhysicalAddress {
        PhysicalAddress(ptr as usize)
    }

    /// The zero address, which no valid buffer ever occupies.
    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns the lower 32 bits, as written into a `*BAL` register.
    pub const fn low_u32(&self) -> u32 {
        self.0 as u32
    }

    /// Returns the upper 32 bits, as written into a `*BAH` register.
    pub const fn high_u32(&self) -> u32 {
        ((self.0 as u64) >> 32) as u32
    }
}

impl Add<usize> for PhysicalAddress {
    type Output = PhysicalAddress;
    fn add(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress(self.0 + rhs)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}


/// The backing memory of a packet buffer.
/// Aligned to 16 bytes so that the device can DMA into it directly.
#[repr(C, align(16))]
struct FrameStorage([u8; PACKET_BUFFER_SIZE_IN_BYTES]);

/// A buffer that stores one network frame, either one to be transmitted
/// or one that was received from the NIC.
/// Auto-dereferences into a byte slice covering its first `length()` bytes.
///
/// Ownership moves with the value: while a descriptor ring holds a `PacketBuffer`,
/// nothing else can reach it.
pub struct PacketBuffer {
    storage: Box<FrameStorage>,
    length: u16,
}

impl PacketBuffer {
    /// Creates a new, zero-length `PacketBuffer`.
    pub fn new() -> PacketBuffer {
        PacketBuffer {
            storage: Box::new(FrameStorage([0; PACKET_BUFFER_SIZE_IN_BYTES])),
            length: 0,
        }
    }

    /// Creates a new `PacketBuffer` holding a copy of `frame`.
    ///
    /// Returns an error if `frame` does not fit into a single buffer.
    pub fn from_slice(frame: &[u8]) -> Result<PacketBuffer, &'static str> {
        if frame.len() > PACKET_BUFFER_SIZE_IN_BYTES {
            return Err("PacketBuffer::from_slice(): frame is larger than a packet buffer");
        }
        let mut buffer = PacketBuffer::new();
        buffer.storage.0[..frame.len()].copy_from_slice(frame);
        buffer.length = frame.len() as u16;
        Ok(buffer)
    }

    /// The bus address of the start of this buffer's data area.
    pub fn phys_addr(&self) -> PhysicalAddress {
        PhysicalAddress::from_ptr(self.storage.0.as_ptr())
    }

    /// The number of valid bytes in this buffer.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// The fixed size of this buffer's data area.
    pub const fn capacity(&self) -> u16 {
        PACKET_BUFFER_SIZE_IN_BYTES as u16
    }

    /// Sets the number of valid bytes in this buffer.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: u16) -> Result<(), &'static str> {
        if length > self.capacity() {
            Err("PacketBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }

    /// Sets the number of valid bytes in this buffer, truncated to its capacity,
    /// and returns the length that was actually set.
    pub fn set_length_truncated(&mut self, length: u16) -> u16 {
        self.length = length.min(self.capacity());
        self.length
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        PacketBuffer::new()
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.storage.0[..usize::from(self.length)]
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.storage.0[..usize::from(self.length)]
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PacketBuffer {{ phys_addr: {:#X}, length: {} }}", self.phys_addr(), self.length)
    }
}


/// The source and sink of every `PacketBuffer` a NIC driver lends to hardware.
///
/// A driver calls [`alloc`](Self::alloc) to obtain a buffer for a receive slot
/// and [`free`](Self::free) exactly once for each transmit buffer the device has finished with.
pub trait PacketBufferAllocator: Send + Sync {
    /// Returns a zero-length buffer, or `None` if no buffer is available.
    fn alloc(&self) -> Option<PacketBuffer>;

    /// Takes back a buffer that is no longer used by the driver.
    fn free(&self, buffer: PacketBuffer);
}


/// A bounded pool of preallocated packet buffers.
///
/// `alloc()` takes a buffer out of the pool and `free()` puts it back.
/// Once the pool is empty, allocation fails until a buffer is freed.
pub struct BufferPool {
    buffers: Mutex<Vec<PacketBuffer>>,
    capacity: usize,
}

impl BufferPool {
    /// Creates an empty pool that can hold up to `capacity` buffers.
    pub const fn new(capacity: usize) -> BufferPool {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Adds a buffer to the pool.
    ///
    /// If the pool is full, it returns an `Err` containing the buffer that was being pushed.
    pub fn push(&self, buffer: PacketBuffer) -> Result<(), PacketBuffer> {
        let mut buffers = self.buffers.lock();
        if buffers.len() >= self.capacity {
            return Err(buffer);
        }
        buffers.push(buffer);
        Ok(())
    }

    /// Removes a buffer from the pool, if any remain.
    pub fn pop(&self) -> Option<PacketBuffer> {
        self.buffers.lock().pop()
    }

    /// The number of buffers currently in the pool.
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl PacketBufferAllocator for BufferPool {
    fn alloc(&self) -> Option<PacketBuffer> {
        let mut buffer = self.pop()?;
        buffer.length = 0;
        Some(buffer)
    }

    fn free(&self, buffer: PacketBuffer) {
        if let Err(_b) = self.push(buffer) {
            warn!("BufferPool::free(): pool is full, dropping buffer at {:#X}", _b.phys_addr());
        }
    }
}
