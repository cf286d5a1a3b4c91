pub mod id;
pub mod retry;
