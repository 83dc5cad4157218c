//! Platform-specific primitives (§2 "Platform layer", §9 "Polymorphism
//! over platform").
//!
//! A single internal surface — `create_segment_mmap`, `attach_segment_mmap`,
//! `is_process_alive`, `current_pid`, `monotonic_nanos`, and [`ControlMutex`]
//! — is implemented once per target OS. The RW coordinator and engines call
//! only this surface and never branch on `cfg(target_os)` themselves.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(target_os = "linux"))]
compile_error!(
    "datablock_core's platform layer is implemented for Linux only; \
     see DESIGN.md for the Windows primitives this would need (\
     OpenProcess/GetExitCodeProcess liveness, a named mutex with \
     abandon detection, VirtualQuery-based size checks)."
);
