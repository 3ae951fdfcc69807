//! Vectored-read planning
//!
//! A vectored read arrives as a list of `(offset, length)` extents. The
//! [`ExtentCoalescer`] splits that list into groups; the file layer then
//! issues one transport read per group spanning its extents and scatters the
//! bytes back into the caller's buffers.

pub mod coalesce;
pub mod extent;

mod proptest;

pub use coalesce::ExtentCoalescer;
pub use extent::{Extent, ExtentHolder};
