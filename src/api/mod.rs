pub mod identity;
pub mod routes;
pub mod sse;
