pub mod resolver;

pub use resolver::{should_resolve_handle, IdentityResolver, WebIdentityResolver};
