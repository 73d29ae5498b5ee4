//! OS virtual-memory primitives consumed by [`crate::pool`].
//!
//! Three operations: query the page size, reserve an anonymous RWX page,
//! and toggle a page's write permission. Both backends return
//! `Option`/`bool` sentinels and never panic, matching the rest of this
//! crate's error model.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub(crate) use unix::*;
    } else if #[cfg(windows)] {
        mod windows;
        pub(crate) use windows::*;
    } else {
        compile_error!("bridgebuilder's code pool requires a unix or windows target");
    }
}
