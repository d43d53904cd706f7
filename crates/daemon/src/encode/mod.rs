//! Encoding for videos with a chosen quality result

pub mod ab_av1;
pub mod worker;

pub use ab_av1::{build_encode_args, EncodeError, EncodeParams};
pub use worker::{ClaimedEncode, EncodeContext, EncodeWorker};
