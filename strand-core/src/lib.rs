// vim: tw=80

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Placement math reads better with explicit comparisons
#![allow(clippy::manual_range_contains)]

pub mod client;
pub mod device;
pub mod driver;
pub mod header;
pub mod io;
pub mod segment;
pub mod striping;
pub mod types;
pub mod util;

pub use crate::types::*;
pub use crate::util::*;
