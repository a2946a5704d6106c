pub mod api;
pub mod presence;
pub mod router;
pub mod sweep;
