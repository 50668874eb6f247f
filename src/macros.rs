//! Logging shims.
//!
//! With the `tracing` feature these forward to `tracing`. Without it they
//! still type-check the format string and arguments, then emit nothing.
//! Only positional format arguments are supported.

macro_rules! log_event {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        {
            tracing::$level!($($arg)+);
        }
        #[cfg(not(feature = "tracing"))]
        {
            if false {
                let _ = format_args!($($arg)+);
            }
        }
    }};
}

macro_rules! trace {
    ($($arg:tt)+) => { log_event!(trace, $($arg)+) };
}

macro_rules! debug {
    ($($arg:tt)+) => { log_event!(debug, $($arg)+) };
}

macro_rules! info {
    ($($arg:tt)+) => { log_event!(info, $($arg)+) };
}

macro_rules! warn {
    ($($arg:tt)+) => { log_event!(warn, $($arg)+) };
}
