//! Session description handling
//!
//! [`RemoteSdp`] renders the SFU side of the negotiation; [`utils`] reads the
//! descriptions the local engine produces.

mod media_section;
mod remote_sdp;
pub mod utils;

pub use media_section::{MediaSection, SectionRole};
pub use remote_sdp::RemoteSdp;
