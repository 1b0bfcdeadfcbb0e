use thiserror::Error;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every failure a rewrite session can hit maps to one of these variants. All of them are
/// unrecoverable for the session that raised them: a partially captured or partially encoded
/// function would be unsound to execute, so the library never produces partial results. After
/// any error the owning [`crate::Rewriter`] must be reset before it can be used again, and the
/// caller is expected to fall back to invoking the original, unrewritten function.
///
/// # Error Categories
///
/// ## Decode
/// - [`Error::Decode`] - Unrecognized or malformed instruction encoding
/// - [`Error::Unsupported`] - A decoded instruction the emulator or encoder cannot handle
///
/// ## Capture
/// - [`Error::CaptureOverflow`] - Configured decode/capture capacity exceeded
/// - [`Error::Assumption`] - A capture-time assumption could not be upheld
///
/// ## Generation
/// - [`Error::Encode`] - A captured instruction has no known re-encoding, or branch fixup failed
/// - [`Error::StorageExhausted`] - The code buffer ran out of committed capacity
///
/// ## Usage
/// - [`Error::Config`] - The rewriter was configured inconsistently or used out of order
#[derive(Error, Debug)]
pub enum Error {
    /// An instruction at the given address could not be decoded.
    ///
    /// Incorrect decode would silently corrupt the abstract machine state, so there is no
    /// best-effort mode: the first unrecognized encoding aborts the session. The raw bytes
    /// are included so the failing encoding can be inspected.
    #[error("decode failed at {address:#x} (bytes {bytes:02x?}): {message}")]
    Decode {
        /// Address of the instruction that failed to decode.
        address: u64,
        /// The raw bytes at that address, up to the maximum instruction length.
        bytes: Vec<u8>,
        /// Description of what was not understood.
        message: String,
    },

    /// A correctly decoded instruction is outside the subset the emulator or encoder handles.
    ///
    /// Carries the rendered instruction text so diagnostics do not require re-decoding.
    #[error("unsupported instruction at {address:#x}: {text}")]
    Unsupported {
        /// Address of the offending instruction.
        address: u64,
        /// Human-readable rendering of the instruction.
        text: String,
    },

    /// A configured decode or capture capacity was exceeded.
    ///
    /// The session cannot silently truncate a function, so running out of instruction,
    /// block or code-byte capacity is fatal. Raising the relevant capacity via
    /// [`crate::Rewriter::set_decode_capacity`] or [`crate::Rewriter::set_capture_capacity`]
    /// is the intended remedy.
    #[error("capture overflow: {what} limit of {limit} exceeded")]
    CaptureOverflow {
        /// Which capacity ran out (e.g. "captured instructions", "decoded blocks").
        what: &'static str,
        /// The configured limit that was hit.
        limit: usize,
    },

    /// A capture-time assumption could not be upheld.
    ///
    /// Examples: a branch or call target that had to be statically known was dynamic, a
    /// stack-pointer update depended on a runtime value, or a dynamic-address write was
    /// proven to alias a tracked static stack slot.
    #[error("assumption violated at {address:#x}: {message}")]
    Assumption {
        /// Address of the instruction where the assumption broke.
        address: u64,
        /// Description of the violated assumption.
        message: String,
    },

    /// A captured instruction could not be re-encoded, or block layout failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The code buffer does not have enough remaining capacity.
    ///
    /// Code storage is sized once at construction and never grows; callers size it via
    /// [`crate::Rewriter::set_capture_capacity`].
    #[error("code storage exhausted: requested {requested} bytes, {available} available")]
    StorageExhausted {
        /// Bytes that were requested.
        requested: usize,
        /// Bytes still available in the buffer.
        available: usize,
    },

    /// The rewriter was configured inconsistently or used out of order.
    #[error("configuration error: {0}")]
    Config(String),

    /// File I/O error.
    ///
    /// Raised by the code-storage mapping layer when the kernel refuses an allocation or a
    /// protection change.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_renders_context() {
        let err = Error::Decode {
            address: 0x401000,
            bytes: vec![0x0f, 0x05],
            message: "syscall is not supported".into(),
        };
        let text = err.to_string();
        assert!(text.contains("0x401000"));
        assert!(text.contains("0f"));
        assert!(text.contains("syscall"));
    }

    #[test]
    fn overflow_names_limit() {
        let err = Error::CaptureOverflow {
            what: "captured instructions",
            limit: 64,
        };
        assert!(err.to_string().contains("64"));
    }
}
