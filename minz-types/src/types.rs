//! The MinZ surface type model.

use std::fmt;

/// Layout of a string value in target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StringKind {
    /// `u8` length prefix followed by the bytes.
    PascalShort,
    /// `u16` length prefix followed by the bytes.
    PascalLong,
    /// Null-terminated byte pointer.
    CStyle,
}

/// Fixed-point layouts, each a distinct primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FixedFormat {
    /// 8 integer bits, 8 fractional bits.
    Q8_8,
    /// 16 integer bits, 8 fractional bits.
    Q16_8,
    /// 4 integer bits, 12 fractional bits.
    Q4_12,
}

impl FixedFormat {
    /// Storage size in bytes.
    pub const fn size(&self) -> u16 {
        match self {
            Self::Q8_8 | Self::Q4_12 => 2,
            Self::Q16_8 => 3,
        }
    }
}

/// A named struct field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: Type,
}

/// A struct definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StructDef {
    /// Type name.
    pub name: String,
    /// Ordered fields.
    pub fields: Vec<Field>,
}

impl StructDef {
    /// Byte offset of a field, if present.
    pub fn offset_of(&self, field: &str) -> Option<u16> {
        let mut offset = 0u16;
        for f in &self.fields {
            if f.name == field {
                return Some(offset);
            }
            offset = offset.wrapping_add(f.ty.size_of());
        }
        None
    }
}

/// An enum variant with its discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Variant {
    /// Variant name.
    pub name: String,
    /// Discriminant value, always a single byte on the target.
    pub value: u8,
}

/// An enum definition. The underlying representation is `u8`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnumDef {
    /// Type name.
    pub name: String,
    /// Declared variants.
    pub variants: Vec<Variant>,
}

impl EnumDef {
    /// Whether the discriminants form a contiguous run starting anywhere.
    ///
    /// Dense, contiguous enums with few variants lower to jump tables.
    pub fn is_contiguous(&self) -> bool {
        if self.variants.is_empty() {
            return false;
        }
        let mut values: Vec<u8> = self.variants.iter().map(|v| v.value).collect();
        values.sort_unstable();
        values.windows(2).all(|w| w[1] == w[0].wrapping_add(1))
    }
}

/// The MinZ type lattice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Type {
    /// Unsigned byte.
    U8,
    /// Unsigned 16-bit word.
    U16,
    /// Signed byte.
    I8,
    /// Signed 16-bit word.
    I16,
    /// Boolean, stored as one byte.
    Bool,
    /// No value.
    Void,
    /// Fixed-point primitive.
    Fixed(FixedFormat),
    /// Pointer to `T`.
    Ptr(Box<Type>),
    /// Fixed-length array.
    Array(Box<Type>, u16),
    /// Aggregate with named fields.
    Struct(StructDef),
    /// Tagged byte enum.
    Enum(EnumDef),
    /// Function type: parameter types and return type.
    Function(Vec<Type>, Box<Type>),
    /// String with a concrete memory layout.
    String(StringKind),
}

impl Type {
    /// Size of a value of this type in target bytes.
    pub fn size_of(&self) -> u16 {
        match self {
            Self::U8 | Self::I8 | Self::Bool | Self::Enum(_) => 1,
            Self::U16 | Self::I16 => 2,
            Self::Void => 0,
            Self::Fixed(f) => f.size(),
            // Pointers, function values and string handles are 16-bit
            // addresses on every supported target.
            Self::Ptr(_) | Self::Function(..) | Self::String(_) => 2,
            Self::Array(elem, n) => elem.size_of().wrapping_mul(*n),
            Self::Struct(s) => s.fields.iter().map(|f| f.ty.size_of()).sum(),
        }
    }

    /// Whether the type is a scalar machine value.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::U8
                | Self::U16
                | Self::I8
                | Self::I16
                | Self::Bool
                | Self::Enum(_)
                | Self::Ptr(_)
                | Self::Fixed(FixedFormat::Q8_8 | FixedFormat::Q4_12)
        )
    }

    /// Whether the type is signed.
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::I8 | Self::I16)
    }

    /// Whether a parameter of this type may be passed through a patched
    /// immediate operand: scalar and at most 16 bits wide.
    pub fn is_tsmc_eligible(&self) -> bool {
        self.is_scalar() && self.size_of() <= 2
    }

    /// Implicit widening: `u8 -> u16`, `i8 -> i16`, enum -> `u8`.
    pub fn widens_to(&self, other: &Type) -> bool {
        matches!(
            (self, other),
            (Self::U8, Self::U16) | (Self::I8, Self::I16) | (Self::Enum(_), Self::U8)
        )
    }

    /// Whether an argument of this type is accepted by a parameter of
    /// `param` either exactly or after implicit widening.
    pub fn coerces_to(&self, param: &Type) -> bool {
        self == param || self.widens_to(param)
    }

    /// The component of this type's mangled name.
    ///
    /// Overloaded functions append one suffix per parameter, separated by
    /// `$`: `print$u8`, `max$u16$u16`.
    pub fn mangle(&self) -> String {
        match self {
            Self::U8 => "u8".into(),
            Self::U16 => "u16".into(),
            Self::I8 => "i8".into(),
            Self::I16 => "i16".into(),
            Self::Bool => "bool".into(),
            Self::Void => "void".into(),
            Self::Fixed(FixedFormat::Q8_8) => "f8.8".into(),
            Self::Fixed(FixedFormat::Q16_8) => "f16.8".into(),
            Self::Fixed(FixedFormat::Q4_12) => "f4.12".into(),
            Self::Ptr(inner) => format!("p{}", inner.mangle()),
            Self::Array(elem, n) => format!("a{n}{}", elem.mangle()),
            Self::Struct(s) => s.name.clone(),
            Self::Enum(e) => e.name.clone(),
            Self::Function(params, ret) => {
                let params: Vec<_> = params.iter().map(Type::mangle).collect();
                format!("fn{}_{}", params.join("_"), ret.mangle())
            }
            Self::String(_) => "str".into(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ptr(inner) => write!(f, "*{inner}"),
            Self::Array(elem, n) => write!(f, "[{elem}; {n}]"),
            Self::Struct(s) => f.write_str(&s.name),
            Self::Enum(e) => f.write_str(&e.name),
            Self::Function(params, ret) => {
                let params: Vec<_> = params.iter().map(Type::to_string).collect();
                write!(f, "fn({}) -> {ret}", params.join(", "))
            }
            Self::String(_) => f.write_str("String"),
            other => f.write_str(&other.mangle()),
        }
    }
}
