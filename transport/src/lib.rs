//! A best-effort message transport on top of UDP, designed for streaming big, periodically
//!  produced payloads (camera frames) with low latency, plus small control messages in the
//!  opposite direction.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, i.e. defined-length chunks of data, each
//!   tagged with a message type
//! * Messages of arbitrary size are split into fragments that fit into a single datagram, avoiding
//!   IP-level fragmentation. The datagram size is configured since MTU discovery does not work
//!   reliably
//! * Fragments may arrive out of order or duplicated, the receiver places each one at the byte
//!   offset it carries
//! * There is no retransmission and no congestion control. A message with a missing fragment is
//!   discarded after a configurable timeout - for camera frames, the next frame is more useful
//!   than a late one
//! * A message that was completed or discarded can not be completed again by stragglers
//! * The sender emits heartbeats ('synchro' messages) when it is idle and after each message. The
//!   receiver uses their send timestamps to estimate the offset between the peers' clocks, which
//!   allows converting remote capture timestamps into the local time base without a shared clock
//! * There is a checksum per datagram
//! * Receiving happens on an OS thread. Completed messages are pulled by the application, which
//!   never blocks on the receive thread
//!
//! ## Packet header
//!
//! Every datagram starts with a fixed-size header, all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: message type (u8)
//!  1: message id (i32) - counted per message type by the sender
//!  5: packet index (u32) - index of this fragment inside the message
//!  9: packet count (u32) - number of fragments in the message, always at least 1
//! 13: total payload bytes (u64) - size of the reassembled message
//! 21: fragment offset (u64) - offset of this fragment inside the reassembled message
//! 29: sender timestamp (i64) - nanoseconds since the Unix epoch in the sender's clock
//! 37: fragment checksum (u32) - CRC-32 (ISO-HDLC) of the fragment
//! 41: fragment
//! ```
//!
//! Message types are defined in [packet_header::MessageType]. Their payload formats are defined by
//!  the application, with the exception of 'synchro' which has no payload.

pub mod buf_ext;
pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod error;
pub mod events;
pub mod fragmentation;
pub mod packet_header;
pub mod reassembly;
pub mod receive_loop;
pub mod safe_converter;
pub mod send_pipeline;
