use thiserror::Error;

/// Errors produced while lowering MIR down to assembly.
///
/// The backend does not attempt local recovery: the first failure is
/// reported with the pass it occurred in and compilation stops.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("{pass}: unsupported construct: {message}")]
    UnsupportedConstruct { pass: &'static str, message: String },

    #[error("{pass}: immediate {value} does not fit in a {width}-bit {signedness} field ({context})")]
    ImmediateOutOfRange {
        pass: &'static str,
        value: i64,
        width: u8,
        signedness: &'static str,
        context: String,
    },

    #[error("regalloc: ran out of registers in `{function}` (both caller-saved and callee-saved pools exhausted)")]
    RegisterExhaustion { function: String },

    #[error("{pass}: malformed IR: {message}")]
    InvalidIrShape { pass: &'static str, message: String },

    #[error("{path}:{line}: {message}")]
    MirParse {
        path: String,
        line: usize,
        message: String,
    },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CodegenError {
    pub fn unsupported(pass: &'static str, message: impl Into<String>) -> Self {
        Self::UnsupportedConstruct {
            pass,
            message: message.into(),
        }
    }

    pub fn invalid_ir(pass: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidIrShape {
            pass,
            message: message.into(),
        }
    }
}

/// Checks that `value` fits in `width` unsigned bits, the encodable range of
/// AArch64 ALU immediates.
pub fn check_uint(
    pass: &'static str,
    value: i64,
    width: u8,
    context: impl Into<String>,
) -> Result<(), CodegenError> {
    if value >= 0 && (width >= 64 || value < (1i64 << width)) {
        return Ok(());
    }
    Err(CodegenError::ImmediateOutOfRange {
        pass,
        value,
        width,
        signedness: "unsigned",
        context: context.into(),
    })
}

/// Checks that `value` fits in `width` signed bits.
pub fn check_int(
    pass: &'static str,
    value: i64,
    width: u8,
    context: impl Into<String>,
) -> Result<(), CodegenError> {
    let bound = 1i64 << (width - 1);
    if value >= -bound && value < bound {
        return Ok(());
    }
    Err(CodegenError::ImmediateOutOfRange {
        pass,
        value,
        width,
        signedness: "signed",
        context: context.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uimm12_bounds() {
        assert!(check_uint("isel", 0, 12, "add").is_ok());
        assert!(check_uint("isel", 4095, 12, "add").is_ok());
        assert!(check_uint("isel", 4096, 12, "add").is_err());
        assert!(check_uint("isel", -1, 12, "add").is_err());
    }

    #[test]
    fn simm16_bounds() {
        assert!(check_int("isel", -32768, 16, "mov").is_ok());
        assert!(check_int("isel", 32767, 16, "mov").is_ok());
        assert!(check_int("isel", 32768, 16, "mov").is_err());
    }
}
