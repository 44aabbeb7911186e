// src/error.rs
//! Error handling for the whole crate.
//!
//! One enum covers every failure the resource core can report: context creation,
//! shader compile/link, missing files, undecodable images and bad texture requests.
//! Variants carry only owned data so the type stays `Send + Sync + Clone` and can be
//! shipped back from loader workers inside decode results.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Shader pipeline stage a diagnostic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Main error type.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// No graphics context could be obtained at any feature level.
    #[error("graphics context creation failed: {0}")]
    ContextCreation(String),

    /// A shader stage failed to parse or validate. `log` holds the compiler output.
    #[error("{stage} shader compile error:\n{log}")]
    ShaderCompile { stage: ShaderStage, log: String },

    /// Both stages compiled but do not form a usable program.
    #[error("shader link error: {0}")]
    ShaderLink(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The bytes could not be decoded by any supported decoder.
    #[error("unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    /// Explicit allocations must be power-of-two in both dimensions.
    #[error("texture dimensions {width}x{height} are not a power of two")]
    InvalidTextureDimensions { width: u32, height: u32 },

    /// Decode-time downscale factor was not a power of two.
    #[error("scale factor {0} is not a power of two")]
    InvalidScale(u32),

    /// Partial updates must span whole rows.
    #[error("sub-row texture update rejected (x_offset {x_offset}, width {width}, texture width {texture_width})")]
    SubRowUpdate {
        x_offset: u32,
        width: u32,
        texture_width: u32,
    },

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Material descriptor failed to deserialize.
    #[error("material descriptor error: {0}")]
    Descriptor(Arc<serde_json::Error>),

    /// I/O errors other than a missing file.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("{0}")]
    Custom(String),

    /// Context chaining, see [`crate::context::Context`].
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Descriptor(Arc::new(err))
    }
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    /// Wrap this error with a higher-level message.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    /// Reads a file, mapping a missing path to [`Error::FileNotFound`].
    pub fn read_file(path: impl Into<PathBuf>) -> Result<Vec<u8>> {
        let path = path.into();
        std::fs::read(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path),
            _ => Error::from(err).context(format!("reading {}", path.display())),
        })
    }

    /// The innermost error once all context layers are peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    // === kind checks (look through context layers) ===
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::FileNotFound(_))
    }

    #[inline]
    pub fn is_unsupported_format(&self) -> bool {
        matches!(self.root(), Error::UnsupportedImageFormat(_))
    }

    #[inline]
    pub fn is_shader(&self) -> bool {
        matches!(self.root(), Error::ShaderCompile { .. } | Error::ShaderLink(_))
    }

    #[inline]
    pub fn is_invalid_dimensions(&self) -> bool {
        matches!(self.root(), Error::InvalidTextureDimensions { .. })
    }
}

/// Convenient `Result` alias, use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_chain_keeps_root_kind() {
        let err = Error::FileNotFound(PathBuf::from("missing.tga")).context("loading material");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "loading material: file not found: missing.tga");
    }

    #[test]
    fn test_read_file_missing() {
        let err = Error::read_file("/definitely/not/here.webp").unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_shader_compile_message() {
        let err = Error::ShaderCompile {
            stage: ShaderStage::Fragment,
            log: "unknown identifier".into(),
        };
        assert!(err.is_shader());
        assert!(err.to_string().starts_with("fragment shader compile error"));
    }
}
