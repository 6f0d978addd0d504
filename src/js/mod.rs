pub(crate) mod bindings;
pub mod convert;
pub mod dom;
pub mod events;
pub mod runtime;
