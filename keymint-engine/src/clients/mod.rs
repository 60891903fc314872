//! Outbound provider clients: auth-token caching, checkout creation, and
//! rate-limited, cached status queries.

/// Cobre API client.
pub mod cobre;
/// ePayco validation API client.
pub mod epayco;
