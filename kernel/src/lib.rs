//! RookOS kernel core.
//!
//! A teaching-grade monolithic kernel's hard parts: the cooperative
//! scheduler and its synchronization primitives, the process and thread
//! lifecycle, demand-paged virtual memory with copy-on-write shadow chains,
//! and the path-resolution + file-descriptor surface of the VFS. The
//! machine-dependent collaborators (page allocator, page tables, TLB,
//! interrupt masking, the context switch) sit behind narrow shims, hosted
//! implementations of which let the whole kernel boot and run inside
//! `cargo test`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod errno;
pub mod fs;
pub mod memory;
pub mod sync;
pub mod task;
