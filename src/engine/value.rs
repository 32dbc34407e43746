//! Values returned from JIT-compiled code.

use std::fmt;

use crate::ir::{mask_to_width, sign_extend, TypeRef};

/// Result of [`ExecutionEngine::run`](super::ExecutionEngine::run).
///
/// `bits` is masked to `width`; a `void` result has width 0 and bits 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericValue {
    ty: TypeRef,
    width: u32,
    bits: u64,
}

impl GenericValue {
    pub(crate) fn new(ty: TypeRef, width: u32, raw: u64) -> Self {
        Self { ty, width, bits: mask_to_width(raw, width) }
    }

    /// The declared return type of the function that produced the value.
    pub fn ty(&self) -> TypeRef {
        self.ty
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn is_void(&self) -> bool {
        self.width == 0
    }

    /// Raw two's-complement bits.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn as_u64(&self) -> u64 {
        self.bits
    }

    /// The value read as a signed integer of its width.
    pub fn as_i64(&self) -> i64 {
        sign_extend(self.bits, self.width)
    }
}

impl fmt::Display for GenericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            f.write_str("void")
        } else {
            write!(f, "{}", self.as_i64())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_and_sign_extends() {
        let v = GenericValue::new(TypeRef(0), 32, 0xffff_ffff_8000_0000);
        assert_eq!(v.bits(), 0x8000_0000);
        assert_eq!(v.as_i64(), i32::MIN as i64);
        assert_eq!(v.to_string(), "-2147483648");

        let void = GenericValue::new(TypeRef(1), 0, 1234);
        assert!(void.is_void());
        assert_eq!(void.bits(), 0);
        assert_eq!(void.to_string(), "void");
    }
}
