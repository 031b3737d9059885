pub mod common;
pub mod configmap;
pub mod secret;

pub use common::{FIELD_MANAGER, owner_reference, standard_labels};
