pub mod chat;
pub mod model;
pub mod serve;
