//! Architecture-specific instruction decoding and code emission.
//!
//! One implementation per target architecture behind a small polymorphic
//! interface; [`native()`] returns the build-time selection. Both decoders
//! are pure byte-level code and compile everywhere, which keeps them
//! testable from any host.

use std::ops::Range;

use crate::types::MockError;

pub mod arm64;
pub mod x86_64;

/// Length of the absolute branch written over a patched entry. Identical on
/// both supported architectures.
pub const BRANCH_LEN: usize = 16;

/// Integer argument registers available to the dispatch stub. Shapes whose
/// extended arity exceeds this cannot be intercepted.
#[cfg(target_arch = "x86_64")]
pub const MAX_REG_ARGS: usize = 6;
#[cfg(target_arch = "aarch64")]
pub const MAX_REG_ARGS: usize = 8;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const MAX_REG_ARGS: usize = 0;

/// Architecture-conditional decoding, kept behind one interface instead of
/// conditional branches at every call site.
pub trait InstructionDecoder: Send + Sync {
    /// Byte offset of the first instruction boundary at or past `required`.
    fn disassemble(&self, code: &[u8], required: usize, safety: bool) -> Result<usize, MockError>;

    /// Single qualifying call target of a generic dispatch shim.
    fn locate_indirect_target(
        &self,
        code: &[u8],
        pc: usize,
        skip: &[Range<usize>],
    ) -> Result<usize, MockError>;

    /// Branch sequence redirecting a patched entry into `hook`.
    fn branch_into(&self, hook: usize) -> Vec<u8>;

    /// Branch sequence returning from a proxy block to `addr`.
    fn branch_to(&self, addr: usize) -> Vec<u8>;

    /// Emit the per-mock dispatch stub into `buf`; returns the emitted
    /// length.
    fn emit_dispatch_stub(&self, buf: &mut [u8], state: usize, dispatcher: usize) -> usize;
}

pub struct X86_64Decoder;

impl InstructionDecoder for X86_64Decoder {
    fn disassemble(&self, code: &[u8], required: usize, safety: bool) -> Result<usize, MockError> {
        x86_64::decoder::disassemble(code, required, safety)
    }

    fn locate_indirect_target(
        &self,
        code: &[u8],
        pc: usize,
        skip: &[Range<usize>],
    ) -> Result<usize, MockError> {
        x86_64::decoder::locate_indirect_target(code, pc, skip)
    }

    fn branch_into(&self, hook: usize) -> Vec<u8> {
        x86_64::writer::branch_into(hook)
    }

    fn branch_to(&self, addr: usize) -> Vec<u8> {
        x86_64::writer::branch_to(addr)
    }

    fn emit_dispatch_stub(&self, buf: &mut [u8], state: usize, dispatcher: usize) -> usize {
        x86_64::writer::emit_dispatch_stub(buf, state, dispatcher)
    }
}

pub struct Arm64Decoder;

impl InstructionDecoder for Arm64Decoder {
    fn disassemble(&self, code: &[u8], required: usize, safety: bool) -> Result<usize, MockError> {
        arm64::decoder::disassemble(code, required, safety)
    }

    fn locate_indirect_target(
        &self,
        code: &[u8],
        pc: usize,
        skip: &[Range<usize>],
    ) -> Result<usize, MockError> {
        arm64::decoder::locate_indirect_target(code, pc, skip)
    }

    fn branch_into(&self, hook: usize) -> Vec<u8> {
        arm64::writer::branch_into(hook)
    }

    fn branch_to(&self, addr: usize) -> Vec<u8> {
        arm64::writer::branch_to(addr)
    }

    fn emit_dispatch_stub(&self, buf: &mut [u8], state: usize, dispatcher: usize) -> usize {
        arm64::writer::emit_dispatch_stub(buf, state, dispatcher)
    }
}

/// The decoder for the architecture this crate was built for.
pub fn native() -> &'static dyn InstructionDecoder {
    #[cfg(target_arch = "x86_64")]
    {
        static D: X86_64Decoder = X86_64Decoder;
        &D
    }
    #[cfg(target_arch = "aarch64")]
    {
        static D: Arm64Decoder = Arm64Decoder;
        &D
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        struct Unsupported;
        impl InstructionDecoder for Unsupported {
            fn disassemble(&self, _: &[u8], _: usize, _: bool) -> Result<usize, MockError> {
                Err(MockError::Unsupported)
            }
            fn locate_indirect_target(
                &self,
                _: &[u8],
                _: usize,
                _: &[Range<usize>],
            ) -> Result<usize, MockError> {
                Err(MockError::Unsupported)
            }
            fn branch_into(&self, _: usize) -> Vec<u8> {
                Vec::new()
            }
            fn branch_to(&self, _: usize) -> Vec<u8> {
                Vec::new()
            }
            fn emit_dispatch_stub(&self, _: &mut [u8], _: usize, _: usize) -> usize {
                0
            }
        }
        static D: Unsupported = Unsupported;
        &D
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_sequences_have_uniform_length() {
        for dec in [&X86_64Decoder as &dyn InstructionDecoder, &Arm64Decoder] {
            assert_eq!(dec.branch_into(0x1234_5678).len(), BRANCH_LEN);
            assert_eq!(dec.branch_to(0x1234_5678).len(), BRANCH_LEN);
        }
    }

    #[test]
    fn native_decoder_walks_its_own_branch() {
        // The branch-into sequence must itself disassemble cleanly in unsafe
        // mode; the proxy builder length-walks patched entries.
        let dec = native();
        let bytes = dec.branch_into(0x7FFF_0000_1234);
        if bytes.is_empty() {
            return;
        }
        let cut = dec.disassemble(&bytes, 8, false).unwrap();
        assert!(cut >= 8);
    }
}
