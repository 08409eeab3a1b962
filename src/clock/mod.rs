//! NTP-style clock synchronization against the robot's time reference.

pub mod ntp;
pub mod sync;

pub use ntp::{TimeSample, RTT_REJECT_US};
pub use sync::{ClockHandle, ClockSync};
