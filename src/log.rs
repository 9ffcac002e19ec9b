//! Leveled logging for the drivers.
//!
//! With the `defmt` feature enabled every macro forwards to the matching `defmt`
//! macro. Without it the macros expand to nothing, so logging costs no flash.

#[cfg(feature = "defmt")]
macro_rules! debug {
    ($($arg:tt)*) => {{
        defmt::debug!($($arg)*);
    }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! debug {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "defmt")]
macro_rules! info {
    ($($arg:tt)*) => {{
        defmt::info!($($arg)*);
    }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! info {
    ($($arg:tt)*) => {{}};
}

#[cfg(feature = "defmt")]
macro_rules! warning {
    ($($arg:tt)*) => {{
        defmt::warn!($($arg)*);
    }};
}

#[cfg(not(feature = "defmt"))]
macro_rules! warning {
    ($($arg:tt)*) => {{}};
}

// `warn` would clash with the built-in lint attribute
pub(crate) use {debug, info, warning};
