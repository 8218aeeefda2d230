#![cfg_attr(not(test), no_std)]

extern crate nic_buffers;


use core::fmt;
use nic_buffers::PacketBuffer;


/// A trait that defines the necessary minimum functions that all network interface card (NIC) drivers
/// should implement. 
pub trait NetworkInterfaceCard {
    /// Sends a packet contained in the given `transmit_buffer` out through this NetworkInterfaceCard.
    /// 
    /// This does not block waiting for the hardware: if no transmit slot is free,
    /// the buffer is handed back inside [`TransmitError::Busy`] and the caller decides whether to retry.
    fn send_packet(&self, transmit_buffer: PacketBuffer) -> Result<(), TransmitError>;

    /// Poll the NIC for received frames, delivering each one to the network stack's ingress.
    /// Can be used as an alternative to interrupts, or as a supplement to interrupts.
    /// 
    /// Returns the number of frames delivered.
    fn poll_receive(&self) -> usize;

    /// Returns the MAC address that this NIC is configured with.
    fn mac_address(&self) -> [u8; 6];
}


/// The entry point of the network stack, to which a NIC driver hands every received frame.
pub trait NetworkIngress: Send + Sync {
    /// Consumes one received frame. Ownership of `buffer` passes to the network stack;
    /// the driver never sees it again.
    fn net_rx(&self, buffer: PacketBuffer);
}


/// The reasons a packet could not be handed to the NIC for transmission.
/// 
/// Every variant returns ownership of the packet buffer to the caller.
pub enum TransmitError {
    /// The transmit ring has no software-owned slot: the device hasn't finished
    /// the packet previously placed in the next slot.
    Busy(PacketBuffer),
    /// There is no NIC to send on.
    Uninitialized(PacketBuffer),
}

impl TransmitError {
    /// Recovers the packet buffer that couldn't be sent.
    pub fn into_buffer(self) -> PacketBuffer {
        match self {
            TransmitError::Busy(buffer) | TransmitError::Uninitialized(buffer) => buffer,
        }
    }

    /// Returns a short description of this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmitError::Busy(_) => "transmit ring is full",
            TransmitError::Uninitialized(_) => "NIC was not yet initialized",
        }
    }
}

impl fmt::Debug for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransmitError::Busy(b) => write!(f, "Busy(length: {})", b.length()),
            TransmitError::Uninitialized(b) => write!(f, "Uninitialized(length: {})", b.length()),
        }
    }
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
