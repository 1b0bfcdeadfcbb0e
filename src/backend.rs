//! Handoff surface for external code generators.
//!
//! The built-in encoder is not the only possible consumer of a capture: an external
//! backend (an optimizing JIT, a C emitter, an analysis pass) can pull decoded blocks
//! through [`DecodeSource`] and take the finalized graph from
//! [`crate::Rewriter::captured_graph`], together with a [`BackendRequest`] describing
//! what to generate. The core only defines the contract; it renders nothing itself.

use std::rc::Rc;

use crate::decode::{DecodedBlock, Decoder};
use crate::rewriter::Rewriter;
use crate::Result;

/// Anything that can serve decoded basic blocks by address.
pub trait DecodeSource {
    /// The decoded block starting at `address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Decode`] or [`crate::Error::CaptureOverflow`] as the
    /// underlying decoder does.
    fn decode_block(&mut self, address: u64) -> Result<Rc<DecodedBlock>>;
}

impl DecodeSource for Decoder {
    fn decode_block(&mut self, address: u64) -> Result<Rc<DecodedBlock>> {
        self.decode(address)
    }
}

/// What an external backend is asked to produce from a captured graph.
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    /// Symbol name for the generated artifact.
    pub name: String,
    /// Stack bytes the generated function may use beyond the captured frame.
    pub stack_size: usize,
    /// Human-readable signature, e.g. `"u64 (u64, u64)"`.
    pub signature: String,
    /// Ask the backend not to merge identical blocks, keeping the graph shape.
    pub disable_dedup: bool,
}

impl BackendRequest {
    /// A request with a name and defaults for everything else.
    #[must_use]
    pub fn named(name: impl Into<String>) -> BackendRequest {
        BackendRequest {
            name: name.into(),
            ..BackendRequest::default()
        }
    }
}

impl DecodeSource for Rewriter {
    fn decode_block(&mut self, address: u64) -> Result<Rc<DecodedBlock>> {
        self.decoder_mut().decode(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_serves_blocks_through_the_trait() {
        // mov rax, rdi; ret
        let code: [u8; 4] = [0x48, 0x89, 0xf8, 0xc3];
        let mut decoder = Decoder::new(16, 4);
        let block = decoder.decode_block(code.as_ptr() as u64).unwrap();
        assert_eq!(block.instructions.len(), 2);
    }

    #[test]
    fn named_request_defaults() {
        let request = BackendRequest::named("specialized_sum");
        assert_eq!(request.name, "specialized_sum");
        assert_eq!(request.stack_size, 0);
        assert!(!request.disable_dedup);
    }
}
