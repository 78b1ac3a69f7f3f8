pub mod chunk_record;
pub mod message;
