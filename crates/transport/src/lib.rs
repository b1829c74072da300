pub mod channel;
pub mod chat;
pub mod decode;
pub mod plugins;
