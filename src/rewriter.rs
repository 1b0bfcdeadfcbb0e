//! The public rewriting session: configure, capture, encode, hand out a function.
//!
//! # Overview
//!
//! A [`Rewriter`] owns everything one specialization session needs: the decoder and its
//! block cache, the capture configuration, and the executable [`CodeStorage`] the encoded
//! result lands in. The usual flow is:
//!
//! ```no_run
//! # use respin::{Rewriter, Result};
//! # fn target(_: u64) -> u64 { 0 }
//! # fn main() -> Result<()> {
//! let mut rewriter = Rewriter::new()?;
//! rewriter.set_target_function(target as usize as u64);
//! rewriter.set_param_count(1)?;
//! rewriter.declare_static_param(0)?;
//! // SAFETY: `target` is a plain compiled function matching the declared signature.
//! let specialized = unsafe { rewriter.rewrite(&[42])? };
//! let f: unsafe extern "C" fn(u64) -> u64 = unsafe { specialized.as_fn1() };
//! # Ok(())
//! # }
//! ```
//!
//! Generated code lives only as long as the rewriter: the returned [`RewrittenFn`]
//! borrows it, so the borrow checker stops the handle from outliving the mapping.
//! A failed rewrite leaves the session poisoned; call [`Rewriter::reset`] before
//! rewriting again.

use std::marker::PhantomData;

use log::debug;

use crate::capture::{capture, CaptureConfig, CaptureGraph, MemRange};
use crate::codegen::{encode_graph, CodeStorage};
use crate::decode::Decoder;
use crate::{Error, Result};

const DEFAULT_DECODE_INSTRUCTIONS: usize = 4096;
const DEFAULT_DECODE_BLOCKS: usize = 512;
const DEFAULT_CAPTURE_INSTRUCTIONS: usize = 2048;
const DEFAULT_CAPTURE_BLOCKS: usize = 256;
const DEFAULT_CODE_BYTES: usize = 64 * 1024;

/// A specialized function living in a rewriter's code storage.
///
/// The handle borrows the rewriter that produced it, which keeps the underlying mapping
/// alive and executable for as long as the handle exists.
pub struct RewrittenFn<'a> {
    entry: u64,
    len: usize,
    _storage: PhantomData<&'a CodeStorage>,
}

impl RewrittenFn<'_> {
    /// Entry address of the generated code.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Size of the generated code in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes were generated (never the case for a successful rewrite).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The entry as a one-argument function.
    ///
    /// # Safety
    /// The original function must actually take one integer argument and return one
    /// integer result under the System V ABI; the caller asserts the signature.
    #[must_use]
    pub unsafe fn as_fn1(&self) -> unsafe extern "C" fn(u64) -> u64 {
        std::mem::transmute(self.entry as usize)
    }

    /// The entry as a two-argument function.
    ///
    /// # Safety
    /// As [`RewrittenFn::as_fn1`], for two integer arguments.
    #[must_use]
    pub unsafe fn as_fn2(&self) -> unsafe extern "C" fn(u64, u64) -> u64 {
        std::mem::transmute(self.entry as usize)
    }

    /// The entry as a three-argument function.
    ///
    /// # Safety
    /// As [`RewrittenFn::as_fn1`], for three integer arguments.
    #[must_use]
    pub unsafe fn as_fn3(&self) -> unsafe extern "C" fn(u64, u64, u64) -> u64 {
        std::mem::transmute(self.entry as usize)
    }
}

impl std::fmt::Debug for RewrittenFn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewrittenFn")
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("len", &self.len)
            .finish()
    }
}

/// One rewriting session: configuration, caches and generated code.
pub struct Rewriter {
    decoder: Decoder,
    config: CaptureConfig,
    storage: CodeStorage,
    target: Option<u64>,
    capture_instructions: usize,
    capture_blocks: usize,
    graph: Option<CaptureGraph>,
    poisoned: bool,
}

impl Rewriter {
    /// A rewriter with default capacities.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the executable mapping cannot be created.
    pub fn new() -> Result<Rewriter> {
        Ok(Rewriter {
            decoder: Decoder::new(DEFAULT_DECODE_INSTRUCTIONS, DEFAULT_DECODE_BLOCKS),
            config: CaptureConfig::new(),
            storage: CodeStorage::new(DEFAULT_CODE_BYTES)?,
            target: None,
            capture_instructions: DEFAULT_CAPTURE_INSTRUCTIONS,
            capture_blocks: DEFAULT_CAPTURE_BLOCKS,
            graph: None,
            poisoned: false,
        })
    }

    /// Sets the function to rewrite.
    pub fn set_target_function(&mut self, address: u64) {
        self.target = Some(address);
    }

    /// Replaces the decoder with one holding new capacity limits, dropping its cache.
    pub fn set_decode_capacity(&mut self, max_instructions: usize, max_blocks: usize) {
        self.decoder = Decoder::new(max_instructions, max_blocks);
    }

    /// Sets the capture budgets and remaps code storage to `max_code_bytes`.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the new mapping cannot be created.
    pub fn set_capture_capacity(
        &mut self,
        max_instructions: usize,
        max_blocks: usize,
        max_code_bytes: usize,
    ) -> Result<()> {
        self.capture_instructions = max_instructions;
        self.capture_blocks = max_blocks;
        if max_code_bytes != self.storage.capacity() {
            self.storage = CodeStorage::new(max_code_bytes)?;
        }
        Ok(())
    }

    /// Forwards to [`CaptureConfig::set_param_count`].
    ///
    /// # Errors
    /// Returns [`Error::Config`] for more than six parameters.
    pub fn set_param_count(&mut self, count: usize) -> Result<()> {
        self.config.set_param_count(count)
    }

    /// Forwards to [`CaptureConfig::declare_static_param`].
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the index is out of range.
    pub fn declare_static_param(&mut self, index: usize) -> Result<()> {
        self.config.declare_static_param(index)
    }

    /// Treat calls at or beyond `depth` as opaque; `None` folds through all depths.
    pub fn set_force_unknown_depth(&mut self, depth: Option<u32>) {
        self.config.force_unknown_depth = depth;
    }

    /// Resolve dynamic branches from the capture run's concrete values.
    pub fn set_assume_known_branches(&mut self, assume: bool) {
        self.config.assume_known_branches = assume;
    }

    /// Declares that the target returns a large value through a hidden pointer.
    pub fn set_returns_via_pointer(&mut self, via_pointer: bool) {
        self.config.returns_via_pointer = via_pointer;
    }

    /// Registers a known memory range for call inlining or constant folding.
    pub fn add_memory_range(&mut self, range: MemRange) {
        self.config.add_range(range);
    }

    /// Logs every decoded instruction at trace level.
    pub fn set_trace_decode(&mut self, trace: bool) {
        self.config.trace_decode = trace;
    }

    /// Logs every emulated and captured instruction at trace level.
    pub fn set_trace_capture(&mut self, trace: bool) {
        self.config.trace_capture = trace;
    }

    /// The block graph of the most recent successful rewrite.
    #[must_use]
    pub fn captured_graph(&self) -> Option<&CaptureGraph> {
        self.graph.as_ref()
    }

    pub(crate) fn decoder_mut(&mut self) -> &mut Decoder {
        &mut self.decoder
    }

    /// Clears caches, configuration, generated code and the poisoned flag.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.config.reset();
        self.storage.reset();
        self.graph = None;
        self.target = None;
        self.poisoned = false;
    }

    /// Captures and re-encodes the target function, specialized for `args`.
    ///
    /// `args` supplies a concrete value for every declared parameter; values for
    /// parameters not declared static are shadow samples only and do not constrain the
    /// generated code.
    ///
    /// # Safety
    /// The target address must point at decodable machine code for a function that obeys
    /// the declared parameter convention, and every registered memory range must be
    /// readable for the duration of the call. The emulator reads process memory at
    /// capture time based on these declarations.
    ///
    /// # Errors
    /// Any [`Error`] from decoding, capture or encoding. After an error the session is
    /// poisoned and further rewrites fail with [`Error::Config`] until
    /// [`Rewriter::reset`] is called.
    pub unsafe fn rewrite(&mut self, args: &[u64]) -> Result<RewrittenFn<'_>> {
        if self.poisoned {
            return Err(Error::Config(
                "rewriter is poisoned by an earlier failure; call reset() first".into(),
            ));
        }
        let entry = self
            .target
            .ok_or_else(|| Error::Config("no target function set".into()))?;
        self.decoder.set_trace(self.config.trace_decode);
        // Assume failure; cleared only once run() has succeeded.
        self.poisoned = true;
        let (addr, len) = self.run(entry, args)?;
        self.poisoned = false;
        Ok(RewrittenFn {
            entry: addr,
            len,
            _storage: PhantomData,
        })
    }

    fn run(&mut self, entry: u64, args: &[u64]) -> Result<(u64, usize)> {
        let graph = capture(
            &mut self.decoder,
            &self.config,
            entry,
            args,
            self.capture_instructions,
            self.capture_blocks,
        )?;
        debug!(
            "captured {} blocks / {} instructions from {entry:#x}",
            graph.blocks().len(),
            graph.instr_count()
        );
        let base = self.storage.next_address();
        let code = encode_graph(&graph, base)?;
        let addr = self.storage.commit(&code)?;
        debug_assert_eq!(addr, base);
        self.storage.make_executable()?;
        debug!("encoded {} bytes at {addr:#x}", code.len());
        self.graph = Some(graph);
        Ok((addr, code.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_without_a_target_is_a_config_error() {
        let mut rewriter = Rewriter::new().unwrap();
        let err = unsafe { rewriter.rewrite(&[]) }.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn failed_rewrite_poisons_until_reset() {
        // 0x0f 0x05 is syscall, which the decoder rejects.
        let bad: [u8; 2] = [0x0f, 0x05];
        let mut rewriter = Rewriter::new().unwrap();
        rewriter.set_target_function(bad.as_ptr() as u64);
        assert!(unsafe { rewriter.rewrite(&[]) }.is_err());
        let again = unsafe { rewriter.rewrite(&[]) }.unwrap_err();
        assert!(matches!(again, Error::Config(_)));
        rewriter.reset();
        // After reset the target is cleared; the poison is gone.
        let err = unsafe { rewriter.rewrite(&[]) }.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rewritten_fn_debug_shows_the_entry() {
        // mov rax, rdi; ret
        let code: [u8; 4] = [0x48, 0x89, 0xf8, 0xc3];
        let mut rewriter = Rewriter::new().unwrap();
        rewriter.set_target_function(code.as_ptr() as u64);
        rewriter.set_param_count(1).unwrap();
        let rewritten = unsafe { rewriter.rewrite(&[1]) }.unwrap();
        let rendered = format!("{rewritten:?}");
        assert!(rendered.contains("RewrittenFn"));
        assert!(rendered.contains(&format!("{:#x}", rewritten.entry())));
    }

    #[test]
    fn capture_graph_is_available_after_a_rewrite() {
        // mov rax, rdi; ret
        let code: [u8; 4] = [0x48, 0x89, 0xf8, 0xc3];
        let mut rewriter = Rewriter::new().unwrap();
        rewriter.set_target_function(code.as_ptr() as u64);
        rewriter.set_param_count(1).unwrap();
        assert!(rewriter.captured_graph().is_none());
        unsafe { rewriter.rewrite(&[1]) }.unwrap();
        let graph = rewriter.captured_graph().unwrap();
        assert_eq!(graph.blocks().len(), 1);
    }
}
