//! Legacy transmit and receive descriptors, as used by the e1000 family
//! (sections 3.2.3 and 3.3.3 of the PCI/PCI-X Family of Gigabit Ethernet Controllers SDM).
//!
//! Every field is accessed with volatile reads and writes,
//! because the device reads and writes descriptors through DMA at any time.

use core::fmt;
use bit_field::BitField;
use nic_buffers::PhysicalAddress;
use volatile::Volatile;


/// A trait for functionalities that all transmit descriptors must support.
pub trait TxDescriptor: Default {
    /// Initializes a transmit descriptor as an empty slot owned by software:
    /// all fields are cleared except the Descriptor Done status bit, which is set.
    fn init(&mut self);

    /// Updates the transmit descriptor to send one packet,
    /// then surrenders the descriptor to the device by clearing its status.
    ///
    /// # Arguments
    /// * `transmit_buffer_addr`: physical address of the transmit buffer.
    /// * `transmit_buffer_length`: length of the packet we want to send.
    fn send(&mut self, transmit_buffer_addr: PhysicalAddress, transmit_buffer_length: u16);

    /// Returns true if the device has finished with this descriptor,
    /// meaning software owns it again.
    fn descriptor_done(&self) -> bool;
}

/// A trait for functionalities that all receive descriptors must support.
pub trait RxDescriptor: Default {
    /// Initializes a receive descriptor by clearing its status
    /// and setting the descriptor's physical address.
    ///
    /// # Arguments
    /// * `packet_buffer_address`: starting physical address of the receive buffer.
    fn init(&mut self, packet_buffer_address: PhysicalAddress);

    /// Updates the descriptor's physical address.
    ///
    /// # Arguments
    /// * `packet_buffer_address`: starting physical address of the receive buffer.
    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress);

    /// Clears the length and status of the descriptor, handing it back to the device.
    fn reset_status(&mut self);

    /// Returns true if the descriptor has a received packet copied to its buffer.
    fn descriptor_done(&self) -> bool;

    /// Returns true if the descriptor's packet buffer is the last in a frame.
    fn end_of_packet(&self) -> bool;

    /// The length of the packet in the descriptor's packet buffer, as written by the device.
    fn length(&self) -> u16;
}


/// This struct is a Legacy Transmit Descriptor.
/// There is one instance of this struct per transmit ring slot.
#[repr(C, align(16))]
pub struct LegacyTxDescriptor {
    /// The starting physical address of the transmit buffer
    pub phys_addr:  Volatile<u64>,
    /// Length of the transmit buffer in bytes
    pub length:     Volatile<u16>,
    /// Checksum offset: where to insert the checksum from the start of the packet if enabled
    pub cso:        Volatile<u8>,
    /// Command bits
    pub cmd:        Volatile<u8>,
    /// Status bits
    pub status:     Volatile<u8>,
    /// Checksum start: where to begin computing the checksum, if enabled
    pub css:        Volatile<u8>,
    /// Vlan tags
    pub vlan:       Volatile<u16>,
}

const_assert_eq!(core::mem::size_of::<LegacyTxDescriptor>(), 16);

impl Default for LegacyTxDescriptor {
    fn default() -> Self {
        LegacyTxDescriptor {
            phys_addr:  Volatile::new(0),
            length:     Volatile::new(0),
            cso:        Volatile::new(0),
            cmd:        Volatile::new(0),
            status:     Volatile::new(0),
            css:        Volatile::new(0),
            vlan:       Volatile::new(0),
        }
    }
}

impl TxDescriptor for LegacyTxDescriptor {
    fn init(&mut self) {
        self.phys_addr.write(0);
        self.length.write(0);
        self.cso.write(0);
        self.cmd.write(0);
        self.css.write(0);
        self.vlan.write(0);
        self.status.write(TX_STATUS_DD);
    }

    fn send(&mut self, transmit_buffer_addr: PhysicalAddress, transmit_buffer_length: u16) {
        self.phys_addr.write(transmit_buffer_addr.value() as u64);
        self.length.write(transmit_buffer_length);
        self.cmd.write(TX_CMD_EOP | TX_CMD_RS);
        // clearing Descriptor Done must come last: it hands the slot to the device
        self.status.write(0);
    }

    fn descriptor_done(&self) -> bool {
        self.status.read().get_bit(TX_STATUS_DD_BIT)
    }
}

impl fmt::Debug for LegacyTxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, length: {}, cso: {}, cmd: {:#X}, status: {:#X}, css: {}, vlan: {}}}",
            self.phys_addr.read(), self.length.read(), self.cso.read(), self.cmd.read(), self.status.read(), self.css.read(), self.vlan.read())
    }
}


/// This struct is a Legacy Receive Descriptor.
/// There is one instance of this struct per receive buffer.
#[repr(C, align(16))]
pub struct LegacyRxDescriptor {
    /// The starting physical address of the receive buffer
    pub phys_addr:  Volatile<u64>,
    /// Length of the received packet in bytes, written by the device
    pub length:     Volatile<u16>,
    /// Checksum value of the packet after the IP header till the end
    pub checksum:   Volatile<u16>,
    /// Status bits which tell if the descriptor has been used
    pub status:     Volatile<u8>,
    /// Receive errors
    pub errors:     Volatile<u8>,
    /// Vlan tags
    pub vlan:       Volatile<u16>,
}

const_assert_eq!(core::mem::size_of::<LegacyRxDescriptor>(), 16);

impl Default for LegacyRxDescriptor {
    fn default() -> Self {
        LegacyRxDescriptor {
            phys_addr:  Volatile::new(0),
            length:     Volatile::new(0),
            checksum:   Volatile::new(0),
            status:     Volatile::new(0),
            errors:     Volatile::new(0),
            vlan:       Volatile::new(0),
        }
    }
}

impl RxDescriptor for LegacyRxDescriptor {
    fn init(&mut self, packet_buffer_address: PhysicalAddress) {
        self.phys_addr.write(packet_buffer_address.value() as u64);
        self.length.write(0);
        self.status.write(0);
    }

    fn set_packet_address(&mut self, packet_buffer_address: PhysicalAddress) {
        self.phys_addr.write(packet_buffer_address.value() as u64);
    }

    fn reset_status(&mut self) {
        self.length.write(0);
        self.status.write(0);
    }

    fn descriptor_done(&self) -> bool {
        self.status.read().get_bit(RX_STATUS_DD_BIT)
    }

    fn end_of_packet(&self) -> bool {
        self.status.read().get_bit(RX_STATUS_EOP_BIT)
    }

    fn length(&self) -> u16 {
        self.length.read()
    }
}

impl fmt::Debug for LegacyRxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, length: {}, checksum: {}, status: {:#X}, errors: {:#X}, vlan: {}}}",
            self.phys_addr.read(), self.length.read(), self.checksum.read(), self.status.read(), self.errors.read(), self.vlan.read())
    }
}


// Transmit descriptor bits
/// Tx Command: End of Packet
pub const TX_CMD_EOP:                      u8 = 1 << 0;
/// Tx Command: Insert FCS
pub const TX_CMD_IFCS:                     u8 = 1 << 1;
/// Tx Command: Insert Checksum
pub const TX_CMD_IC:                       u8 = 1 << 2;
/// Tx Command: Report Status
pub const TX_CMD_RS:                       u8 = 1 << 3;
/// Tx Command: VLAN Packet Enable
pub const TX_CMD_VLE:                      u8 = 1 << 6;
/// Tx Command: Interrupt Delay Enable
pub const TX_CMD_IDE:                      u8 = 1 << 7;
/// Tx Status: Descriptor Done
pub const TX_STATUS_DD:                    u8 = 1 << TX_STATUS_DD_BIT;
const TX_STATUS_DD_BIT:                    usize = 0;

// Receive descriptor bits
/// Rx Status: Descriptor Done
pub const RX_STATUS_DD:                    u8 = 1 << RX_STATUS_DD_BIT;
/// Rx Status: End of Packet
pub const RX_STATUS_EOP:                   u8 = 1 << RX_STATUS_EOP_BIT;
const RX_STATUS_DD_BIT:                    usize = 0;
const RX_STATUS_EOP_BIT:                   usize = 1;
