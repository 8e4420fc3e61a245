pub mod api2d;
pub mod azure;
pub mod custom;
pub mod openai;
pub mod xunfei;
