// src/context.rs
//! Attaching "what was being loaded" to errors.
//!
//! Decoders, descriptor parsing and the wgpu backend produce errors from foreign
//! crates (`std::io`, `serde_json`, `image`, `ktx2`). [`Context`] converts them into
//! [`Error`] and wraps them with the asset or step that failed, so the text stored in
//! `Renderer::last_error` reads `couldn't load: stone.json: ...` instead of a bare
//! parser message. [`OptionContext`] covers lookups that come back empty, like a
//! texture without pixels or a backend without a device.

use std::fmt;

use crate::error::{Error, Result};

/// Context for any `Result` whose error converts into [`Error`].
pub trait Context<T>: Sized {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Like [`context`](Self::context), but the message is only built on failure.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;

    /// Tags a failure with the asset it came from, as `couldn't load: <asset>`.
    fn loading(self, asset: impl fmt::Display) -> Result<T> {
        self.with_context(|| format!("couldn't load: {}", asset))
    }
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// A missing value becomes [`Error::Custom`] carrying the message.
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(f()))
    }
}

/// Returns early from a function yielding [`crate::Result`].
///
/// Takes a message literal, a format string with arguments, or any value that
/// converts into [`Error`] (`bail!(Error::InvalidScale(3))`).
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::Error::msg($msg))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::Error>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::format(format_args!($fmt, $($arg)*)))
    };
}

/// `bail!` unless `$cond` holds. The error argument is only evaluated on failure.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !($cond) {
            $crate::bail!($msg);
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !($cond) {
            $crate::bail!($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure;

    fn block_rows(height: u32) -> Result<u32> {
        ensure!(height % 4 == 0, "{} rows is not a whole number of blocks", height);
        Ok(height / 4)
    }

    #[test]
    fn test_ensure_formats_message() {
        assert_eq!(block_rows(8).unwrap(), 2);
        assert_eq!(block_rows(6).unwrap_err().to_string(), "6 rows is not a whole number of blocks");
    }

    #[test]
    fn test_ensure_takes_error_values() {
        fn scale(factor: u32) -> Result<u32> {
            ensure!(factor.is_power_of_two(), Error::InvalidScale(factor));
            Ok(factor)
        }
        assert!(matches!(scale(3), Err(Error::InvalidScale(3))));
        assert_eq!(scale(4).unwrap(), 4);
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u8> = None;
        let err = missing.context("no texture bound").unwrap_err();
        assert_eq!(err.to_string(), "no texture bound");
    }

    #[test]
    fn test_loading_names_the_asset() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let err = res.loading("atlas.tga").unwrap_err();
        assert_eq!(err.to_string(), "couldn't load: atlas.tga: I/O error: disk gone");
        assert!(matches!(err.root(), Error::Io(_)));
    }
}
