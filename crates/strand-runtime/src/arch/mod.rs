//! Architecture-specific context switching

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::{context_switch, init_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::{context_switch, init_context, Context};
    } else {
        compile_error!("strand-runtime supports x86_64 and aarch64 only");
    }
}
