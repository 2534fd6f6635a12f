//! Backend descriptions.

/// A code generation backend.
///
/// Only the Z80 emitter is part of the core; the remaining names are
/// recognized so the driver can validate `--target` and report a codegen
/// diagnostic instead of an argument error.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Target {
    /// Zilog Z80, the primary target.
    Z80,
    /// Intel 8080.
    I8080,
    /// Game Boy (SM83).
    Gb,
    /// MOS 6502.
    M6502,
    /// Motorola 68000.
    M68k,
    /// WebAssembly.
    Wasm,
    /// Portable C.
    C,
}

impl Target {
    /// Whether generated code may patch its own immediates.
    ///
    /// Cartridge and ahead-of-time targets execute from read-only
    /// storage, so TSMC is off for them regardless of `--enable-smc`.
    pub const fn supports_smc(&self) -> bool {
        matches!(self, Self::Z80 | Self::I8080 | Self::M6502 | Self::M68k)
    }
}
