// tablesync-common: wire protocol, channel naming and the OT model shared by
// the relay and its clients.

pub mod channel;
pub mod ot;
pub mod protocol;
