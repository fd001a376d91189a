//! hycachefs: a user-space filesystem that keeps hot files on a fast tier
//! and migrates cold ones to a slow tier behind symlink redirects.

pub mod capacity;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fuse;
pub mod handle;
pub mod meta;
pub mod migrate;
pub mod path;
pub mod queue;
pub mod state;
pub mod sys;

pub use config::{Args, MountConfig};
pub use dispatch::TierFs;
pub use error::{Result, TierError};
pub use fuse::TierFuse;
