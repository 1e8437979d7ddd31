//! Wire Codec + Protocol Types & Capabilities (spec §4.1, §2).
//!
//! `binary` covers the little-endian binary opcode frames; `json` covers
//! the `op`-tagged JSON control frames and the descriptor types they
//! carry; `parameter` covers the recursive parameter value type.

pub mod binary;
pub mod json;
pub mod parameter;

pub const SUBPROTOCOL: &str = "foxglove.websocket.v1";

pub use parameter::{Parameter, ParameterType, ParameterValue};
