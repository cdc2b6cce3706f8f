//! Long-lived daemon mediating access to a 5G/LTE modem over its AT-command
//! serial port. One port daemon owns the device and serializes commands;
//! a supervisor restarts it on failure; a TTL cache and request coalescer
//! keep identical queries off the wire; an SMS reconciliation loop drains
//! the modem inbox into a SQLite store and fans new messages out to
//! registered observers.

pub mod app;
pub mod config;
pub mod modem;
pub mod serial;
pub mod sms;
