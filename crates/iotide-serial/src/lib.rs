//! # IoT IDE – Device Link
//!
//! Serial communication layer between the IDE and a microcontroller board
//! running a MicroPython-style REPL:
//!
//! - **Transports** – host-process bridge, in-process `serialport` access and
//!   an in-memory simulated device, all behind one `SerialTransport` trait
//! - **Port Discovery** – enumerate ports, rank known boards first, remember
//!   the last device that connected
//! - **Session Management** – one live connection, event fan-out,
//!   auto-connect
//! - **REPL Protocol** – command/response correlation, program execution,
//!   file upload through REPL statements
//! - **Monitor Capture** – record and export serial traffic

pub mod serial;
