//! Architecture-specific context switching
//!
//! Each backend provides the same three items:
//!
//! - `Context` - the callee-saved register block of a suspended coroutine
//! - `init_context` - prime a `Context` so the first switch into it lands
//!   in the entry trampoline with a fresh stack
//! - `swap_context` - save the running context and jump into another one

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, swap_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, swap_context, Context};
    } else {
        compile_error!("corio supports x86_64 and aarch64 only");
    }
}

/// Entry point type the trampoline calls with the primed argument
pub type EntryFn = extern "C" fn(usize);
