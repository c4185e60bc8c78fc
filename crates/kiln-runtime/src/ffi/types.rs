//! Foreign type system
//!
//! Defines:
//! - `ForeignType`: the type tags hosted code declares (`:int`, `:cstring`, ...)
//! - `ForeignSignature`: parameter tags, return tag and calling convention
//! - `ForeignValue`: a native scalar tagged by its machine representation
//!
//! Tag to representation:
//! - `:char`, `:byte`, `:int8-t` → I8; unsigned variants → U8
//! - `:short`, `:int16-t` → I16; `:int`, `:int32-t` → I32
//! - `:long` → the platform `long`; `:long-long`, `:int64-t` → I64
//! - `:float` → F32, `:double` → F64
//! - `:pointer-void`, `:cstring` → Pointer; `:object` → U64 tagged word

use crate::ffi::FfiError;
use libffi::middle::Type;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::os::raw::c_long;
use std::str::FromStr;

/// Type tag of a foreign parameter or result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForeignType {
    Char,
    UnsignedChar,
    Byte,
    UnsignedByte,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    Long,
    UnsignedLong,
    LongLong,
    UnsignedLongLong,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
    PointerVoid,
    CString,
    Object,
    /// Return type only
    Void,
}

/// Machine representation of a foreign scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repr {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
    Void,
}

impl Repr {
    pub fn size(self) -> usize {
        match self {
            Repr::I8 | Repr::U8 => 1,
            Repr::I16 | Repr::U16 => 2,
            Repr::I32 | Repr::U32 | Repr::F32 => 4,
            Repr::I64 | Repr::U64 | Repr::F64 => 8,
            Repr::Pointer => std::mem::size_of::<usize>(),
            Repr::Void => 0,
        }
    }

    pub fn align(self) -> usize {
        match self {
            Repr::I64 | Repr::U64 => std::mem::align_of::<u64>(),
            Repr::F64 => std::mem::align_of::<f64>(),
            Repr::Void => 1,
            other => other.size(),
        }
    }
}

impl ForeignType {
    pub const ALL: [ForeignType; 26] = [
        ForeignType::Char,
        ForeignType::UnsignedChar,
        ForeignType::Byte,
        ForeignType::UnsignedByte,
        ForeignType::Short,
        ForeignType::UnsignedShort,
        ForeignType::Int,
        ForeignType::UnsignedInt,
        ForeignType::Long,
        ForeignType::UnsignedLong,
        ForeignType::LongLong,
        ForeignType::UnsignedLongLong,
        ForeignType::Int8,
        ForeignType::Uint8,
        ForeignType::Int16,
        ForeignType::Uint16,
        ForeignType::Int32,
        ForeignType::Uint32,
        ForeignType::Int64,
        ForeignType::Uint64,
        ForeignType::Float,
        ForeignType::Double,
        ForeignType::PointerVoid,
        ForeignType::CString,
        ForeignType::Object,
        ForeignType::Void,
    ];

    /// Declared name, including the leading colon
    pub fn name(self) -> &'static str {
        match self {
            ForeignType::Char => ":char",
            ForeignType::UnsignedChar => ":unsigned-char",
            ForeignType::Byte => ":byte",
            ForeignType::UnsignedByte => ":unsigned-byte",
            ForeignType::Short => ":short",
            ForeignType::UnsignedShort => ":unsigned-short",
            ForeignType::Int => ":int",
            ForeignType::UnsignedInt => ":unsigned-int",
            ForeignType::Long => ":long",
            ForeignType::UnsignedLong => ":unsigned-long",
            ForeignType::LongLong => ":long-long",
            ForeignType::UnsignedLongLong => ":unsigned-long-long",
            ForeignType::Int8 => ":int8-t",
            ForeignType::Uint8 => ":uint8-t",
            ForeignType::Int16 => ":int16-t",
            ForeignType::Uint16 => ":uint16-t",
            ForeignType::Int32 => ":int32-t",
            ForeignType::Uint32 => ":uint32-t",
            ForeignType::Int64 => ":int64-t",
            ForeignType::Uint64 => ":uint64-t",
            ForeignType::Float => ":float",
            ForeignType::Double => ":double",
            ForeignType::PointerVoid => ":pointer-void",
            ForeignType::CString => ":cstring",
            ForeignType::Object => ":object",
            ForeignType::Void => ":void",
        }
    }

    pub fn repr(self) -> Repr {
        let long = if std::mem::size_of::<c_long>() == 8 {
            (Repr::I64, Repr::U64)
        } else {
            (Repr::I32, Repr::U32)
        };
        match self {
            ForeignType::Char | ForeignType::Byte | ForeignType::Int8 => Repr::I8,
            ForeignType::UnsignedChar | ForeignType::UnsignedByte | ForeignType::Uint8 => Repr::U8,
            ForeignType::Short | ForeignType::Int16 => Repr::I16,
            ForeignType::UnsignedShort | ForeignType::Uint16 => Repr::U16,
            ForeignType::Int | ForeignType::Int32 => Repr::I32,
            ForeignType::UnsignedInt | ForeignType::Uint32 => Repr::U32,
            ForeignType::Long => long.0,
            ForeignType::UnsignedLong => long.1,
            ForeignType::LongLong | ForeignType::Int64 => Repr::I64,
            ForeignType::UnsignedLongLong | ForeignType::Uint64 | ForeignType::Object => Repr::U64,
            ForeignType::Float => Repr::F32,
            ForeignType::Double => Repr::F64,
            ForeignType::PointerVoid | ForeignType::CString => Repr::Pointer,
            ForeignType::Void => Repr::Void,
        }
    }

    pub fn size(self) -> usize {
        self.repr().size()
    }

    pub fn align(self) -> usize {
        self.repr().align()
    }

    /// Integer tags that accept hosted integers
    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            ForeignType::Char
                | ForeignType::UnsignedChar
                | ForeignType::Float
                | ForeignType::Double
                | ForeignType::PointerVoid
                | ForeignType::CString
                | ForeignType::Object
                | ForeignType::Void
        )
    }

    pub fn is_character(self) -> bool {
        matches!(self, ForeignType::Char | ForeignType::UnsignedChar)
    }

    pub fn is_float(self) -> bool {
        matches!(self, ForeignType::Float | ForeignType::Double)
    }

    /// Inclusive value range of an integer tag
    pub fn range(self) -> Option<(i128, i128)> {
        if !self.is_integer() {
            return None;
        }
        Some(match self.repr() {
            Repr::I8 => (i8::MIN as i128, i8::MAX as i128),
            Repr::U8 => (0, u8::MAX as i128),
            Repr::I16 => (i16::MIN as i128, i16::MAX as i128),
            Repr::U16 => (0, u16::MAX as i128),
            Repr::I32 => (i32::MIN as i128, i32::MAX as i128),
            Repr::U32 => (0, u32::MAX as i128),
            Repr::I64 => (i64::MIN as i128, i64::MAX as i128),
            Repr::U64 => (0, u64::MAX as i128),
            _ => return None,
        })
    }

    /// Type after default argument promotion in a variadic position
    pub fn promoted(self) -> ForeignType {
        match self.repr() {
            Repr::I8 | Repr::U8 | Repr::I16 | Repr::U16 => ForeignType::Int,
            Repr::F32 => ForeignType::Double,
            _ => self,
        }
    }

    pub(crate) fn ffi_type(self) -> Type {
        match self.repr() {
            Repr::I8 => Type::i8(),
            Repr::U8 => Type::u8(),
            Repr::I16 => Type::i16(),
            Repr::U16 => Type::u16(),
            Repr::I32 => Type::i32(),
            Repr::U32 => Type::u32(),
            Repr::I64 => Type::i64(),
            Repr::U64 => Type::u64(),
            Repr::F32 => Type::f32(),
            Repr::F64 => Type::f64(),
            Repr::Pointer => Type::pointer(),
            Repr::Void => Type::void(),
        }
    }
}

impl fmt::Display for ForeignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ForeignType {
    type Err = FfiError;

    /// Parse a declared type name; the leading colon is optional
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix(':').unwrap_or(s);
        ForeignType::ALL
            .iter()
            .copied()
            .find(|ty| ty.name()[1..].eq_ignore_ascii_case(bare))
            .ok_or_else(|| FfiError::UnsupportedType(s.to_string()))
    }
}

impl Serialize for ForeignType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for ForeignType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Native calling convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallingConvention {
    #[default]
    Default,
    Cdecl,
    Stdcall,
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallingConvention::Default => ":default",
            CallingConvention::Cdecl => ":cdecl",
            CallingConvention::Stdcall => ":stdcall",
        };
        f.write_str(name)
    }
}

impl FromStr for CallingConvention {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(':').unwrap_or(s).to_ascii_lowercase().as_str() {
            "default" => Ok(CallingConvention::Default),
            "cdecl" => Ok(CallingConvention::Cdecl),
            "stdcall" => Ok(CallingConvention::Stdcall),
            _ => Err(FfiError::UnknownConvention(s.to_string())),
        }
    }
}

/// Runtime description of a native function
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignSignature {
    params: Vec<ForeignType>,
    ret: ForeignType,
    convention: CallingConvention,
    /// Index of the first argument passed through `...`
    variadic_from: Option<usize>,
}

impl ForeignSignature {
    pub fn new(params: Vec<ForeignType>, ret: ForeignType) -> Result<Self, FfiError> {
        if let Some(index) = params.iter().position(|ty| *ty == ForeignType::Void) {
            return Err(FfiError::VoidParameter(index));
        }
        Ok(Self {
            params,
            ret,
            convention: CallingConvention::Default,
            variadic_from: None,
        })
    }

    /// Build from hosted type declarations, e.g. `(&[":int", ":double"], ":int", ":cdecl")`
    pub fn from_declaration(
        params: &[&str],
        ret: &str,
        convention: &str,
    ) -> Result<Self, FfiError> {
        let params = params
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<ForeignType>, _>>()?;
        let sig = Self::new(params, ret.parse()?)?;
        Ok(sig.with_convention(convention.parse()?))
    }

    pub fn with_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Mark arguments from `start` on as passed through `...`
    pub fn variadic(mut self, start: usize) -> Result<Self, FfiError> {
        if start > self.params.len() {
            return Err(FfiError::VariadicStart {
                start,
                count: self.params.len(),
            });
        }
        self.variadic_from = Some(start);
        Ok(self)
    }

    pub fn params(&self) -> &[ForeignType] {
        &self.params
    }

    pub fn ret(&self) -> ForeignType {
        self.ret
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn variadic_from(&self) -> Option<usize> {
        self.variadic_from
    }

    pub fn is_variadic_arg(&self, index: usize) -> bool {
        self.variadic_from.map_or(false, |start| index >= start)
    }

    /// Parameter types as passed, after variadic promotion
    pub fn effective_params(&self) -> Vec<ForeignType> {
        self.params
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                if self.is_variadic_arg(i) {
                    ty.promoted()
                } else {
                    *ty
                }
            })
            .collect()
    }
}

impl fmt::Display for ForeignSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if self.variadic_from == Some(i) {
                write!(f, "&rest ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, ") -> {}", self.ret)?;
        if self.convention != CallingConvention::Default {
            write!(f, " {}", self.convention)?;
        }
        Ok(())
    }
}

/// A native scalar tagged by representation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForeignValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(usize),
    Void,
}

impl ForeignValue {
    pub fn repr(&self) -> Repr {
        match self {
            ForeignValue::I8(_) => Repr::I8,
            ForeignValue::U8(_) => Repr::U8,
            ForeignValue::I16(_) => Repr::I16,
            ForeignValue::U16(_) => Repr::U16,
            ForeignValue::I32(_) => Repr::I32,
            ForeignValue::U32(_) => Repr::U32,
            ForeignValue::I64(_) => Repr::I64,
            ForeignValue::U64(_) => Repr::U64,
            ForeignValue::F32(_) => Repr::F32,
            ForeignValue::F64(_) => Repr::F64,
            ForeignValue::Pointer(_) => Repr::Pointer,
            ForeignValue::Void => Repr::Void,
        }
    }

    /// Build an integer value of representation `repr`, or `None` when out of range
    pub fn from_integer(repr: Repr, n: i128) -> Option<Self> {
        Some(match repr {
            Repr::I8 => ForeignValue::I8(i8::try_from(n).ok()?),
            Repr::U8 => ForeignValue::U8(u8::try_from(n).ok()?),
            Repr::I16 => ForeignValue::I16(i16::try_from(n).ok()?),
            Repr::U16 => ForeignValue::U16(u16::try_from(n).ok()?),
            Repr::I32 => ForeignValue::I32(i32::try_from(n).ok()?),
            Repr::U32 => ForeignValue::U32(u32::try_from(n).ok()?),
            Repr::I64 => ForeignValue::I64(i64::try_from(n).ok()?),
            Repr::U64 => ForeignValue::U64(u64::try_from(n).ok()?),
            Repr::Pointer => ForeignValue::Pointer(usize::try_from(n).ok()?),
            _ => return None,
        })
    }

    pub fn as_integer(&self) -> Option<i128> {
        Some(match *self {
            ForeignValue::I8(n) => n as i128,
            ForeignValue::U8(n) => n as i128,
            ForeignValue::I16(n) => n as i128,
            ForeignValue::U16(n) => n as i128,
            ForeignValue::I32(n) => n as i128,
            ForeignValue::U32(n) => n as i128,
            ForeignValue::I64(n) => n as i128,
            ForeignValue::U64(n) => n as i128,
            ForeignValue::Pointer(p) => p as i128,
            _ => return None,
        })
    }

    /// Apply default argument promotion
    pub fn promote(self) -> Self {
        match self {
            ForeignValue::I8(n) => ForeignValue::I32(n as i32),
            ForeignValue::U8(n) => ForeignValue::I32(n as i32),
            ForeignValue::I16(n) => ForeignValue::I32(n as i32),
            ForeignValue::U16(n) => ForeignValue::I32(n as i32),
            ForeignValue::F32(x) => ForeignValue::F64(x as f64),
            other => other,
        }
    }

    /// Native-endian image, left-aligned in eight bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        match *self {
            ForeignValue::I8(n) => out[..1].copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::U8(n) => out[..1].copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::I16(n) => out[..2].copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::U16(n) => out[..2].copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::I32(n) => out[..4].copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::U32(n) => out[..4].copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::I64(n) => out.copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::U64(n) => out.copy_from_slice(&n.to_ne_bytes()),
            ForeignValue::F32(x) => out[..4].copy_from_slice(&x.to_ne_bytes()),
            ForeignValue::F64(x) => out.copy_from_slice(&x.to_ne_bytes()),
            ForeignValue::Pointer(p) => {
                let bytes = p.to_ne_bytes();
                out[..bytes.len()].copy_from_slice(&bytes);
            }
            ForeignValue::Void => {}
        }
        out
    }

    /// Decode the native image produced by [`ForeignValue::to_bytes`]
    pub fn from_bytes(repr: Repr, bytes: &[u8]) -> Option<Self> {
        fn take<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
            bytes.get(..N)?.try_into().ok()
        }
        Some(match repr {
            Repr::I8 => ForeignValue::I8(i8::from_ne_bytes(take(bytes)?)),
            Repr::U8 => ForeignValue::U8(u8::from_ne_bytes(take(bytes)?)),
            Repr::I16 => ForeignValue::I16(i16::from_ne_bytes(take(bytes)?)),
            Repr::U16 => ForeignValue::U16(u16::from_ne_bytes(take(bytes)?)),
            Repr::I32 => ForeignValue::I32(i32::from_ne_bytes(take(bytes)?)),
            Repr::U32 => ForeignValue::U32(u32::from_ne_bytes(take(bytes)?)),
            Repr::I64 => ForeignValue::I64(i64::from_ne_bytes(take(bytes)?)),
            Repr::U64 => ForeignValue::U64(u64::from_ne_bytes(take(bytes)?)),
            Repr::F32 => ForeignValue::F32(f32::from_ne_bytes(take(bytes)?)),
            Repr::F64 => ForeignValue::F64(f64::from_ne_bytes(take(bytes)?)),
            Repr::Pointer => ForeignValue::Pointer(usize::from_ne_bytes(take(bytes)?)),
            Repr::Void => ForeignValue::Void,
        })
    }

    /// Read a native value of representation `repr` from `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `repr.size()` bytes.
    pub unsafe fn read_from(repr: Repr, ptr: *const u8) -> Self {
        let bytes = std::slice::from_raw_parts(ptr, repr.size());
        // Length matches the representation, so decoding cannot fail.
        Self::from_bytes(repr, bytes).unwrap_or(ForeignValue::Void)
    }

    /// Narrow a raw integer return word to `repr`
    pub(crate) fn from_return_word(repr: Repr, word: u64) -> Self {
        match repr {
            Repr::I8 => ForeignValue::I8(word as i8),
            Repr::U8 => ForeignValue::U8(word as u8),
            Repr::I16 => ForeignValue::I16(word as i16),
            Repr::U16 => ForeignValue::U16(word as u16),
            Repr::I32 => ForeignValue::I32(word as i32),
            Repr::U32 => ForeignValue::U32(word as u32),
            Repr::I64 => ForeignValue::I64(word as i64),
            Repr::U64 => ForeignValue::U64(word),
            Repr::Pointer => ForeignValue::Pointer(word as usize),
            Repr::F32 => ForeignValue::F32(f32::from_bits(word as u32)),
            Repr::F64 => ForeignValue::F64(f64::from_bits(word)),
            Repr::Void => ForeignValue::Void,
        }
    }

    /// Widen to a return word; integers are sign- or zero-extended
    pub(crate) fn to_return_word(self) -> u64 {
        match self {
            ForeignValue::I8(n) => n as i64 as u64,
            ForeignValue::U8(n) => n as u64,
            ForeignValue::I16(n) => n as i64 as u64,
            ForeignValue::U16(n) => n as u64,
            ForeignValue::I32(n) => n as i64 as u64,
            ForeignValue::U32(n) => n as u64,
            ForeignValue::I64(n) => n as u64,
            ForeignValue::U64(n) => n,
            ForeignValue::Pointer(p) => p as u64,
            ForeignValue::F32(x) => x.to_bits() as u64,
            ForeignValue::F64(x) => x.to_bits(),
            ForeignValue::Void => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(":int", ForeignType::Int)]
    #[case("int32-t", ForeignType::Int32)]
    #[case(":UNSIGNED-LONG-LONG", ForeignType::UnsignedLongLong)]
    #[case(":pointer-void", ForeignType::PointerVoid)]
    #[case(":cstring", ForeignType::CString)]
    fn test_parse_type_names(#[case] name: &str, #[case] expected: ForeignType) {
        assert_eq!(name.parse::<ForeignType>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_type_name() {
        assert_eq!(
            ":struct".parse::<ForeignType>(),
            Err(FfiError::UnsupportedType(":struct".to_string()))
        );
    }

    #[test]
    fn test_all_names_round_trip() {
        for ty in ForeignType::ALL {
            assert_eq!(ty.name().parse::<ForeignType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_sizes() {
        assert_eq!(ForeignType::Char.size(), 1);
        assert_eq!(ForeignType::Short.size(), 2);
        assert_eq!(ForeignType::Int.size(), 4);
        assert_eq!(ForeignType::Long.size(), std::mem::size_of::<c_long>());
        assert_eq!(ForeignType::Int64.size(), 8);
        assert_eq!(ForeignType::Double.size(), 8);
        assert_eq!(ForeignType::CString.size(), std::mem::size_of::<usize>());
        assert_eq!(ForeignType::Void.size(), 0);
    }

    #[test]
    fn test_ranges() {
        assert_eq!(ForeignType::UnsignedByte.range(), Some((0, 255)));
        assert_eq!(ForeignType::Int16.range(), Some((-32768, 32767)));
        assert_eq!(ForeignType::Char.range(), None);
        assert_eq!(ForeignType::Double.range(), None);
    }

    #[test]
    fn test_void_parameter_rejected() {
        let err = ForeignSignature::new(vec![ForeignType::Int, ForeignType::Void], ForeignType::Int)
            .unwrap_err();
        assert_eq!(err, FfiError::VoidParameter(1));
    }

    #[test]
    fn test_from_declaration() {
        let sig = ForeignSignature::from_declaration(&[":int32-t", ":int32-t"], ":int32-t", ":default")
            .unwrap();
        assert_eq!(sig.params(), &[ForeignType::Int32, ForeignType::Int32]);
        assert_eq!(sig.ret(), ForeignType::Int32);
        assert_eq!(sig.convention(), CallingConvention::Default);

        assert!(matches!(
            ForeignSignature::from_declaration(&[], ":int", ":fastcall"),
            Err(FfiError::UnknownConvention(_))
        ));
    }

    #[test]
    fn test_signature_display() {
        let sig = ForeignSignature::from_declaration(&[":cstring", ":char", ":float"], ":int", ":cdecl")
            .unwrap()
            .variadic(1)
            .unwrap();
        insta::assert_snapshot!(sig.to_string(), @"(:cstring &rest :char :float) -> :int :cdecl");
    }

    #[test]
    fn test_variadic_promotion() {
        let sig = ForeignSignature::new(
            vec![ForeignType::CString, ForeignType::Char, ForeignType::Float],
            ForeignType::Int,
        )
        .unwrap()
        .variadic(1)
        .unwrap();
        assert_eq!(
            sig.effective_params(),
            vec![ForeignType::CString, ForeignType::Int, ForeignType::Double]
        );
        assert!(sig.clone().variadic(4).is_err());
    }

    #[test]
    fn test_signature_serde() {
        let sig = ForeignSignature::new(vec![ForeignType::Double], ForeignType::Void).unwrap();
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(
            json,
            r#"{"params":[":double"],"ret":":void","convention":"default","variadic_from":null}"#
        );
        let back: ForeignSignature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn test_foreign_value_bytes() {
        let v = ForeignValue::I16(-2);
        assert_eq!(ForeignValue::from_bytes(Repr::I16, &v.to_bytes()), Some(v));
        assert_eq!(ForeignValue::from_bytes(Repr::I64, &[0u8; 4]), None);
    }

    #[test]
    fn test_return_word_narrowing() {
        assert_eq!(
            ForeignValue::from_return_word(Repr::I32, 0xffff_ffff_ffff_fffb),
            ForeignValue::I32(-5)
        );
        assert_eq!(ForeignValue::I8(-1).to_return_word(), u64::MAX);
        assert_eq!(ForeignValue::U8(200).to_return_word(), 200);
    }
}
