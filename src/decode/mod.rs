//! x86-64 instruction decoding into memoized basic blocks.
//!
//! The decoder treats the target function's loaded code as input data: `decode(addr)` reads
//! bytes at the address, parses one variable-length instruction at a time and stops at the
//! first control transfer, producing a [`DecodedBlock`]. Blocks are memoized per address for
//! the lifetime of a rewrite session, so repeated requests are cheap and idempotent.
//!
//! Decode failure is fatal for the session: there is no partial or best-effort decode,
//! because a silently mis-decoded instruction would corrupt the abstract machine state.

mod block;
mod decoder;

pub use block::DecodedBlock;
pub use decoder::{decode_instruction, Decoder};
