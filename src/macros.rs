//! Macros for printing status messages to the console.
use owo_colors::{Color, OwoColorize};
#[doc(hidden)]
pub use owo_colors::colors;
use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enables or disables the output of `debug!` messages.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

#[doc(hidden)]
pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! ok {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<$crate::macros::colors::Green>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        $crate::ok!($title, format!($msg, $($arg)*).as_str());
    };
}

#[macro_export]
macro_rules! info {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<$crate::macros::colors::Cyan>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        $crate::info!($title, format!($msg, $($arg)*).as_str());
    };
}

#[macro_export]
macro_rules! warn {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<$crate::macros::colors::Yellow>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        $crate::warn!($title, format!($msg, $($arg)*).as_str());
    };
}

#[macro_export]
macro_rules! error {
    ($title:expr, $msg:expr) => {
        $crate::macros::print::<$crate::macros::colors::Red>($title, $msg);
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        $crate::error!($title, format!($msg, $($arg)*).as_str());
    };
}

#[macro_export]
macro_rules! debug {
    ($title:expr, $msg:expr) => {
        if $crate::macros::verbose() {
            $crate::macros::print::<$crate::macros::colors::Magenta>($title, $msg);
        }
    };
    ($title:expr, $msg:expr, $($arg:tt)*) => {
        if $crate::macros::verbose() {
            $crate::debug!($title, format!($msg, $($arg)*).as_str());
        }
    };
}

#[doc(hidden)]
pub fn print<C: Color>(title: &str, msg: &str) {
    println!("{:>12} {}", title.fg::<C>().bold(), msg);
}
