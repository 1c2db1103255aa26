pub mod blocking_queue;
pub mod id_source;
pub mod properties;
pub mod safe_converter;
