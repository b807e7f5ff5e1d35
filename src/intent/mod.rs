/// Binary envelope of intent keys and values.
pub mod codec;
/// Structured document paths.
pub mod doc_path;
/// Lock introspection records.
pub mod lock_info;
/// Intent types and their conflict matrix.
pub mod types;
