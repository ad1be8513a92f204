//! Guest time modelling for the z/Architecture helper layer.
//!
//! Every time-related instruction is driven from **guest virtual time** (monotonic nanoseconds
//! since machine reset). In production that value comes from a monotonic host clock; unit tests
//! drive it deterministically through [`FakeHostClock`].
//!
//! The TOD clock counts in units of 2^-12 microseconds (bit 51 ticks once per microsecond), the
//! clock comparator and CPU timer are expressed in the same units.

mod clock;
mod tod;

pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use tod::{ns_to_tod, tod_to_ns, CpuTimer, TodClock, TodClockConfig, TOD_UNITS_PER_US};
