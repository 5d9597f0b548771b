pub mod authenticator;
pub mod jwt;
pub mod middleware;
