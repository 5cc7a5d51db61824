pub mod lock;
pub mod retry;
