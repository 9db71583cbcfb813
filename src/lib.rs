//! Driving USB/serial-attached IEEE 802.15.4 radio sniffer devices.
//!
//! The sniffer firmware speaks a small framed binary protocol; [`frame`]
//! holds the codec that builds outgoing command frames and carves validated
//! frames back out of the raw, arbitrarily chunked serial byte stream.
//! [`device`] owns the serial link and the session state machine: it issues
//! commands, correlates the asynchronously arriving replies, and turns
//! capture notifications into printed records. [`timing`] reconstructs
//! microsecond inter-packet deltas across the hardware counter's overflow,
//! and [`crc`] checks each captured frame's FCS. [`pipe`] accepts live
//! channel/transmit commands on stdin while capture runs.

pub mod crc;
pub mod device;
pub mod frame;
pub mod pipe;
pub mod timing;
