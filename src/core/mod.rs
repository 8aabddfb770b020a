pub mod codec;
pub mod config;
pub mod crc;
pub mod device;
pub mod error;
pub mod gpio;
pub mod rx;
pub mod sync;
pub mod tx;

// Handshake byte opening a session (ASCII SYN)
pub const HANDSHAKE_SYN : u8 = 0x16;
// Payload bytes per packet
pub const MAX_PACKET_DATA : usize = 31;
// seq_num values above this seen in IDLE are line noise, not a packet start
pub const SEQ_NOISE_LIMIT : u8 = 250;
// Bytes accepted by a single TX write call
pub const WRITE_BUFFER_LIMIT : usize = 4096;
// RX byte FIFO capacity (power of two)
pub const RX_FIFO_CAPACITY : usize = 1024;
