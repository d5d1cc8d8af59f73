//! L2CAP definitions used by the security manager
//!
//! Channel management lives outside this crate; only the PSM space is needed
//! to key service security requirements.

pub mod psm;

pub use self::psm::*;
