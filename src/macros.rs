//! Small helper macros shared across the unix syscall wrappers.
#![allow(unused_macros)]

/// Call a libc function and turn a `-1` return into `io::Result::Err` via
/// `errno`. Mirrors the pattern used throughout `sys::unix`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
