//! Sizing and timing parameters for the e1000 driver and its rings.


/// Number of descriptors in the e1000 transmit ring.
/// Must be a power of two, and `E1000_NUM_TX_DESC * 16` must be a multiple of 128.
pub const E1000_NUM_TX_DESC: usize = 16;
/// Number of descriptors in the e1000 receive ring.
/// Must be a power of two, and `E1000_NUM_RX_DESC * 16` must be a multiple of 128.
pub const E1000_NUM_RX_DESC: usize = 16;

/// Size of the data area of every packet buffer.
/// The receive control register is programmed to this buffer size.
pub const PACKET_BUFFER_SIZE_IN_BYTES: usize = 2048;

/// Hardware contract: the byte length of a descriptor ring (TDLEN/RDLEN)
/// must be a multiple of this value.
pub const DESCRIPTOR_RING_LENGTH_ALIGNMENT: usize = 128;

/// How many packet buffers are preallocated into the default buffer pool.
pub const RX_BUFFER_POOL_SIZE: usize = 64;

/// The station address programmed into the receive address filter,
/// which is QEMU's default MAC address for an emulated e1000: 52:54:00:12:34:56.
pub const E1000_DEFAULT_MAC_ADDRESS: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Transmit control: collision threshold (number of retransmit attempts).
pub const E1000_TX_COLLISION_THRESHOLD: u32 = 0x10;
/// Transmit control: collision distance, in byte times (full duplex).
pub const E1000_TX_COLLISION_DISTANCE:  u32 = 0x40;

/// Transmit inter-packet gap: IPGT.
pub const E1000_TIPG_IPGT:  u32 = 10;
/// Transmit inter-packet gap: IPGR1.
pub const E1000_TIPG_IPGR1: u32 = 8;
/// Transmit inter-packet gap: IPGR2.
pub const E1000_TIPG_IPGR2: u32 = 6;
