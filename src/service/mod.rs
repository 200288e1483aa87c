pub mod auth;
pub mod delivery;
pub mod presence;
pub mod rate_limit;
pub mod typing;
