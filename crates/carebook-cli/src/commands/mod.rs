pub mod backup;
pub mod common;
pub mod completions;
pub mod keys;
pub mod record;
pub mod restore;
pub mod sync;
