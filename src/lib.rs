//! Mount flat object-storage buckets as hierarchical filesystems.

pub mod config;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod mount;
pub mod store;
