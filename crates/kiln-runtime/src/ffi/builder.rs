//! Foreign call builder
//!
//! Accumulates the native image of one call's arguments in a fixed buffer,
//! classifying each argument against the host ABI table, then transfers
//! control through a libffi call interface built from the signature.
//!
//! Every check happens before `execute` touches native code: unsupported
//! conventions, buffer overflow, size and arity mismatches. Builders hold
//! only per-call state, so a callback may run its own builder while an
//! outer call is in flight.

use crate::ffi::abi::{align_up, AbiTable, ArgLocation, RegisterCursor};
use crate::ffi::loader::EntryPoint;
use crate::ffi::marshal::{MarshalContext, MarshalError};
use crate::ffi::types::{CallingConvention, ForeignSignature, ForeignType, ForeignValue, Repr};
use crate::ffi::FfiError;
use crate::heap::Collector;
use crate::value::Value;
use libffi::middle::{arg, Arg, Cif, CodePtr};

/// Maximum size of an accumulated call image in bytes
pub const FFI_BUFFER_LIMIT: usize = 256;

#[repr(C, align(16))]
struct CallImage([u8; FFI_BUFFER_LIMIT]);

/// One pushed argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    pub ty: ForeignType,
    /// Byte offset in the call image
    pub offset: usize,
    pub size: usize,
    pub location: ArgLocation,
}

pub struct ForeignCallBuilder {
    image: CallImage,
    cursor: usize,
    slots: Vec<ArgSlot>,
    signature: Option<ForeignSignature>,
    params: Vec<ForeignType>,
    abi: &'static AbiTable,
    registers: RegisterCursor,
    output: ForeignValue,
    marshal: MarshalContext,
}

impl ForeignCallBuilder {
    pub fn new() -> Self {
        Self::with_abi(AbiTable::host())
    }

    /// Builder classifying arguments against a specific table
    pub fn with_abi(abi: &'static AbiTable) -> Self {
        Self {
            image: CallImage([0; FFI_BUFFER_LIMIT]),
            cursor: 0,
            slots: Vec::new(),
            signature: None,
            params: Vec::new(),
            abi,
            registers: RegisterCursor::new(abi),
            output: ForeignValue::Void,
            marshal: MarshalContext::new(),
        }
    }

    /// Reset for a new call with `signature`
    pub fn prepare(&mut self, signature: &ForeignSignature) -> Result<(), FfiError> {
        if signature.convention() == CallingConvention::Stdcall && !self.abi.stdcall {
            return Err(FfiError::UnsupportedConvention {
                convention: CallingConvention::Stdcall,
                abi: self.abi.name,
            });
        }
        // Variadic arguments are passed as promoted fixed arguments, which
        // only lands them correctly where both travel the same way.
        let registers = self.abi.int_registers + self.abi.float_registers;
        if signature.variadic_from().is_some() && self.abi.variadic_on_stack && registers > 0 {
            return Err(FfiError::UnsupportedVariadic(self.abi.name));
        }

        self.image.0.fill(0);
        self.cursor = 0;
        self.slots.clear();
        self.registers.reset();
        self.marshal.clear();
        self.output = ForeignValue::Void;
        self.params = signature.effective_params();
        self.signature = Some(signature.clone());
        Ok(())
    }

    fn next_param(&self) -> Result<(usize, ForeignType), FfiError> {
        if self.signature.is_none() {
            return Err(FfiError::NotPrepared);
        }
        let index = self.slots.len();
        let ty = *self.params.get(index).ok_or(FfiError::ArityMismatch {
            expected: self.params.len(),
            got: index + 1,
        })?;
        Ok((index, ty))
    }

    /// Copy the native image of the next argument into its slot
    pub fn push_bytes(&mut self, data: &[u8]) -> Result<(), FfiError> {
        let (index, ty) = self.next_param()?;
        let size = ty.size();
        if data.len() != size {
            return Err(FfiError::SizeMismatch {
                index,
                expected: size,
                got: data.len(),
            });
        }
        let offset = align_up(self.cursor, ty.align());
        let end = offset + size;
        if end > FFI_BUFFER_LIMIT {
            return Err(FfiError::BufferOverflow {
                needed: end,
                limit: FFI_BUFFER_LIMIT,
            });
        }
        self.image.0[offset..end].copy_from_slice(data);
        self.cursor = end;

        let variadic = self
            .signature
            .as_ref()
            .map_or(false, |sig| sig.is_variadic_arg(index));
        let location = self.registers.assign(ty, variadic);
        self.slots.push(ArgSlot {
            ty,
            offset,
            size,
            location,
        });
        Ok(())
    }

    /// Push an int-sized word as the next argument
    pub fn push_int(&mut self, word: i32) -> Result<(), FfiError> {
        self.push_bytes(&word.to_ne_bytes())
    }

    /// Pad the cursor to a multiple of `n`
    pub fn align(&mut self, n: usize) -> Result<(), FfiError> {
        if !n.is_power_of_two() {
            return Err(FfiError::InvalidAlignment(n));
        }
        let aligned = align_up(self.cursor, n);
        if aligned > FFI_BUFFER_LIMIT {
            return Err(FfiError::BufferOverflow {
                needed: aligned,
                limit: FFI_BUFFER_LIMIT,
            });
        }
        self.cursor = aligned;
        Ok(())
    }

    /// Marshal a hosted value as the next argument
    pub fn push_arg(&mut self, value: &Value, heap: &dyn Collector) -> Result<(), FfiError> {
        let (index, ty) = self.next_param()?;
        let declared = match &self.signature {
            Some(sig) => sig.params()[index],
            None => return Err(FfiError::NotPrepared),
        };
        let mut native = self.marshal.to_foreign(value, declared, heap)?;
        if declared != ty {
            native = native.promote();
        }
        let bytes = native.to_bytes();
        self.push_bytes(&bytes[..ty.size()])
    }

    /// Transfer control to `entry` with the accumulated arguments
    ///
    /// # Safety
    ///
    /// `entry` must be a native function whose real signature matches the
    /// prepared one. Pointer arguments must be valid for whatever the
    /// callee does with them.
    pub unsafe fn execute(
        &mut self,
        entry: EntryPoint,
        return_type: ForeignType,
    ) -> Result<ForeignValue, FfiError> {
        let signature = self.signature.as_ref().ok_or(FfiError::NotPrepared)?;
        if return_type != signature.ret() {
            return Err(FfiError::ReturnTypeMismatch {
                expected: signature.ret(),
                got: return_type,
            });
        }
        if self.slots.len() != self.params.len() {
            return Err(FfiError::ArityMismatch {
                expected: self.params.len(),
                got: self.slots.len(),
            });
        }

        #[allow(unused_mut)]
        let mut cif = Cif::new(
            self.params.iter().map(|ty| ty.ffi_type()),
            return_type.ffi_type(),
        );
        #[cfg(all(windows, target_arch = "x86"))]
        if signature.convention() == CallingConvention::Stdcall {
            cif.set_abi(libffi::raw::ffi_abi_FFI_STDCALL);
        }

        let args: Vec<Arg> = self
            .slots
            .iter()
            .map(|slot| arg(&self.image.0[slot.offset]))
            .collect();
        let code = CodePtr::from_ptr(entry.as_ptr());

        // Integer results come back widened to a full return register.
        let output = match return_type.repr() {
            Repr::Void => {
                cif.call::<()>(code, &args);
                ForeignValue::Void
            }
            Repr::F32 => ForeignValue::F32(cif.call::<f32>(code, &args)),
            Repr::F64 => ForeignValue::F64(cif.call::<f64>(code, &args)),
            repr => ForeignValue::from_return_word(repr, cif.call::<u64>(code, &args)),
        };
        self.output = output;
        Ok(output)
    }

    /// Decode the last result as a hosted value; `None` for `:void`
    pub fn result_value(&self, heap: &dyn Collector) -> Result<Option<Value>, MarshalError> {
        let ret = self
            .signature
            .as_ref()
            .map_or(ForeignType::Void, |sig| sig.ret());
        // SAFETY: the output was produced by `execute` under the prepared
        // signature, so a `:cstring` result is the callee's string.
        unsafe { self.marshal.to_hosted(self.output, ret, heap) }
    }

    /// Bytes accumulated so far
    pub fn image(&self) -> &[u8] {
        &self.image.0[..self.cursor]
    }

    pub fn slots(&self) -> &[ArgSlot] {
        &self.slots
    }

    pub fn output(&self) -> ForeignValue {
        self.output
    }

    pub fn signature(&self) -> Option<&ForeignSignature> {
        self.signature.as_ref()
    }

    pub fn abi(&self) -> &'static AbiTable {
        self.abi
    }
}

impl Default for ForeignCallBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ArenaHeap;
    use pretty_assertions::assert_eq;

    extern "C" fn add_i32(a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn scale(x: f64, k: i8) -> f64 {
        x * k as f64
    }

    extern "C" fn negate_u16(x: u16) -> i64 {
        -(x as i64)
    }

    fn sig(params: &[ForeignType], ret: ForeignType) -> ForeignSignature {
        ForeignSignature::new(params.to_vec(), ret).unwrap()
    }

    #[test]
    fn test_push_int_and_execute() {
        let mut builder = ForeignCallBuilder::new();
        builder
            .prepare(&sig(&[ForeignType::Int32, ForeignType::Int32], ForeignType::Int32))
            .unwrap();
        builder.push_int(2).unwrap();
        builder.push_int(3).unwrap();
        let out = unsafe {
            builder
                .execute(EntryPoint::from_addr(add_i32 as usize), ForeignType::Int32)
                .unwrap()
        };
        assert_eq!(out, ForeignValue::I32(5));
    }

    #[test]
    fn test_mixed_classes() {
        let heap = ArenaHeap::new();
        let mut builder = ForeignCallBuilder::new();
        builder
            .prepare(&sig(&[ForeignType::Double, ForeignType::Byte], ForeignType::Double))
            .unwrap();
        builder.push_arg(&Value::Double(1.5), &heap).unwrap();
        builder.push_arg(&Value::Fixnum(-4), &heap).unwrap();
        unsafe {
            builder
                .execute(
                    EntryPoint::from_addr(scale as usize),
                    ForeignType::Double,
                )
                .unwrap();
        }
        assert_eq!(builder.result_value(&heap).unwrap(), Some(Value::Double(-6.0)));
    }

    #[test]
    fn test_small_unsigned_argument_and_wide_result() {
        let heap = ArenaHeap::new();
        let mut builder = ForeignCallBuilder::new();
        builder
            .prepare(&sig(&[ForeignType::UnsignedShort], ForeignType::Int64))
            .unwrap();
        builder.push_arg(&Value::Fixnum(65535), &heap).unwrap();
        let out = unsafe {
            builder
                .execute(
                    EntryPoint::from_addr(negate_u16 as usize),
                    ForeignType::Int64,
                )
                .unwrap()
        };
        assert_eq!(out, ForeignValue::I64(-65535));
    }

    #[test]
    fn test_slots_follow_natural_alignment() {
        let mut builder = ForeignCallBuilder::with_abi(&AbiTable::SYSV_X86_64);
        builder
            .prepare(&sig(&[ForeignType::Char, ForeignType::Double], ForeignType::Void))
            .unwrap();
        builder.push_bytes(&[7]).unwrap();
        builder.push_bytes(&2.0f64.to_ne_bytes()).unwrap();
        let slots = builder.slots();
        assert_eq!(slots[0].offset, 0);
        assert_eq!(slots[1].offset, 8);
        assert_eq!(slots[0].location, ArgLocation::IntRegister(0));
        assert_eq!(slots[1].location, ArgLocation::FloatRegister(0));
        assert_eq!(builder.image().len(), 16);
    }

    #[test]
    fn test_size_mismatch() {
        let mut builder = ForeignCallBuilder::new();
        builder.prepare(&sig(&[ForeignType::Int], ForeignType::Void)).unwrap();
        assert_eq!(
            builder.push_bytes(&[1, 2]),
            Err(FfiError::SizeMismatch {
                index: 0,
                expected: 4,
                got: 2
            })
        );
    }

    #[test]
    fn test_too_many_pushes() {
        let mut builder = ForeignCallBuilder::new();
        builder.prepare(&sig(&[ForeignType::Int], ForeignType::Void)).unwrap();
        builder.push_int(1).unwrap();
        assert_eq!(
            builder.push_int(2),
            Err(FfiError::ArityMismatch {
                expected: 1,
                got: 2
            })
        );
    }

    #[test]
    fn test_execute_checks_arity_and_return() {
        let mut builder = ForeignCallBuilder::new();
        builder
            .prepare(&sig(&[ForeignType::Int, ForeignType::Int], ForeignType::Int))
            .unwrap();
        builder.push_int(1).unwrap();
        let entry = EntryPoint::from_addr(add_i32 as usize);
        unsafe {
            assert_eq!(
                builder.execute(entry, ForeignType::Int),
                Err(FfiError::ArityMismatch {
                    expected: 2,
                    got: 1
                })
            );
            assert!(matches!(
                builder.execute(entry, ForeignType::Double),
                Err(FfiError::ReturnTypeMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_not_prepared() {
        let mut builder = ForeignCallBuilder::new();
        assert_eq!(builder.push_int(1), Err(FfiError::NotPrepared));
    }

    #[test]
    fn test_align() {
        let mut builder = ForeignCallBuilder::new();
        builder.prepare(&sig(&[ForeignType::Char, ForeignType::Char], ForeignType::Void)).unwrap();
        builder.push_bytes(&[1]).unwrap();
        builder.align(8).unwrap();
        builder.push_bytes(&[2]).unwrap();
        assert_eq!(builder.slots()[1].offset, 8);
        assert_eq!(builder.align(3), Err(FfiError::InvalidAlignment(3)));
    }

    #[test]
    fn test_stdcall_needs_table_support() {
        let stdcall = sig(&[], ForeignType::Void).with_convention(CallingConvention::Stdcall);
        let mut builder = ForeignCallBuilder::with_abi(&AbiTable::SYSV_X86_64);
        assert!(matches!(
            builder.prepare(&stdcall),
            Err(FfiError::UnsupportedConvention { .. })
        ));
        let mut builder = ForeignCallBuilder::with_abi(&AbiTable::I386_CDECL);
        assert!(builder.prepare(&stdcall).is_ok());
    }

    #[test]
    fn test_variadic_rejected_on_apple_arm64() {
        let printf = sig(&[ForeignType::CString, ForeignType::Int], ForeignType::Int)
            .variadic(1)
            .unwrap();
        let mut builder = ForeignCallBuilder::with_abi(&AbiTable::APPLE_ARM64);
        assert_eq!(
            builder.prepare(&printf),
            Err(FfiError::UnsupportedVariadic("Apple arm64"))
        );
        let mut builder = ForeignCallBuilder::with_abi(&AbiTable::SYSV_X86_64);
        assert!(builder.prepare(&printf).is_ok());
    }

    #[test]
    fn test_variadic_argument_promoted() {
        let heap = ArenaHeap::new();
        let mut builder = ForeignCallBuilder::with_abi(&AbiTable::SYSV_X86_64);
        let sig = sig(&[ForeignType::Int, ForeignType::Float], ForeignType::Void)
            .variadic(1)
            .unwrap();
        builder.prepare(&sig).unwrap();
        builder.push_arg(&Value::Fixnum(1), &heap).unwrap();
        builder.push_arg(&Value::Single(0.25), &heap).unwrap();
        let slot = builder.slots()[1];
        assert_eq!(slot.ty, ForeignType::Double);
        assert_eq!(slot.size, 8);
        assert_eq!(
            &builder.image()[slot.offset..slot.offset + 8],
            &0.25f64.to_ne_bytes()
        );
    }
}
