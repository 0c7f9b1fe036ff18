//! A client engine for the IPbus protocol, the UDP register access protocol spoken
//!  by FPGA based hardware in physics data acquisition systems. The device end is
//!  a simple slave: it executes word addressed reads and writes against its
//!  register bus and answers every request packet with exactly one reply packet.
//!  All of the interesting work lives on the client side, in this crate:
//!
//! * The abstraction is register *operations* (read / write / read-modify-write)
//!   of arbitrary size; the engine cuts them into *transactions*, packs
//!   transactions into *packets* no larger than the device's MTU, and answers with
//!   a stream of responses, one per transaction, ending when the operation is
//!   fully resolved
//! * Several packets are kept in flight concurrently, bounded by the smaller of a
//!   configured window and the device's reply buffer count
//! * Devices process packets strictly in packet id order and drop everything else,
//!   so the engine numbers packets sequentially and releases responses to callers
//!   strictly in submission order, whatever order datagrams arrive in
//! * UDP loses datagrams; recovery is driven by the device's status block, which
//!   tells the client whether a request or a reply went missing. A lost reply is
//!   recovered with a resend request (devices buffer their recent replies), a lost
//!   request by retransmitting the in-flight window
//! * Small operations submitted close together share a packet, with a configurable
//!   delay before a partially filled packet goes out (or an explicit dispatch)
//!
//! ## Words and byte order
//!
//! Everything on the wire is built from 32 bit words. A device is wired for one
//!  byte order for control traffic, big or little endian, configured per target;
//!  the leading packet header is recognisable in either, so replies are decoded by
//!  inspection rather than by configuration. Status packets are the exception:
//!  they are always big endian.
//!
//! ## Packet header
//!
//! Every datagram starts with a one word packet header:
//!
//! ```ascii
//! bits 31-28: protocol version, always 0x2
//! bits 27-24: reserved, 0
//! bits 23-8:  packet id (u16) - sequence number for control packets, 0 for
//!              status traffic
//! bits 7-4:   byte order qualifier, always 0xf
//! bits 3-0:   packet type: 0 control, 1 status, 2 resend request
//! ```
//!
//! ## Transaction header
//!
//! A control packet's body is a sequence of transactions, each led by a header
//!  word:
//!
//! ```ascii
//! bits 31-28: protocol version, always 0x2
//! bits 27-16: transaction id - the transaction's position in its packet
//! bits 15-8:  word count (u8)
//! bits 7-4:   type: 0 read, 1 write, 2 non-incrementing read,
//!              3 non-incrementing write, 4 RMW bits, 5 RMW sum
//! bits 3-0:   info code: 0xf in requests, 0 for success in replies, other
//!              values are device side error codes
//! ```
//!
//! A request carries the address word after the header, then any data words
//!  (write data, or the two RMW operands). A reply carries the read payload, the
//!  RMW forms answer with the register value from before the modification.
//!
//! ## Status packets
//!
//! A status request is a 64 byte packet (status header plus 15 zero words); the
//!  device overwrites the body and sends it back:
//!
//! ```ascii
//! word 0:      status packet header (packet id 0)
//! word 1:      MTU in bytes
//! word 2:      number of reply buffers the device keeps for resends
//! word 3:      next expected control packet id, in packet header format
//! words 4-7:   traffic history, 16 single byte event codes
//! words 8-11:  headers of the last received control packets, zero word = unused
//! words 12-15: headers of the last sent reply packets, zero word = unused
//! ```
//!
//! The status exchange doubles as connection setup (it yields the MTU, the window
//!  bound and the packet id to start from) and as the oracle for loss recovery:
//!  whether the lost packet id shows up in the sent or received history decides
//!  between requesting a resend and retransmitting the window.

mod assembler;
pub mod config;
mod engine;
mod packet;
pub mod register;
pub mod response;
mod send_socket;
pub mod target;
pub mod test_util;
pub mod wire;
