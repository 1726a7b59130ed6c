pub mod copy_stream;
pub mod quote;
