//! Building blocks for [`clap`]-driven configuration of the log search
//! server. Every option can also be set from the environment.

pub mod logging;
pub mod meta_store;
pub mod socket_addr;
pub mod tuning;
