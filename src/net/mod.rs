pub mod cipher;
pub mod client;
pub mod packet;
pub mod records;
pub mod server;
