pub mod image;
pub mod network;
pub mod proxy;
pub mod route;
pub mod status;
pub mod switch;
