//! Outbound-request safety shared by redirect validation, CIMD and JWKS fetches.

pub mod ssrf;

pub use ssrf::{AddressAllowance, AddressClass, Resolver, SsrfError, SystemResolver, check_outbound_url};
