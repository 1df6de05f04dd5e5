mod namespace;
mod origin_labels;

pub use namespace::inject_namespace;
pub use origin_labels::inject_origin_labels;
