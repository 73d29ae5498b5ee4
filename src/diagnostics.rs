//! Advisory-only diagnostics.
//!
//! Nothing in this crate's public contract returns a [`Result`]: the
//! decoder, pool, and bridge builder communicate failure only via
//! sentinel return values (`Undecodable`, `null`/`None`). [`DecodeDiagnostic`]
//! exists purely so the decoder can log a human-readable line when it gives
//! up on an opcode; callers must not rely on its presence or wording, only
//! on the `Undecodable` outcome itself.

/// Names the byte and cursor offset the decoder could not classify.
#[derive(Debug, thiserror::Error)]
#[error("undecodable opcode {byte:#04x} at cursor offset {offset}")]
pub struct DecodeDiagnostic {
    /// The byte that didn't match any entry in the opcode table.
    pub byte: u8,
    /// Cursor offset of `byte`, counted from the start of the decode call.
    pub offset: usize,
}
