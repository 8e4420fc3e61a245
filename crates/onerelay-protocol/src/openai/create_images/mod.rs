pub mod request;
pub mod response;

pub use request::CreateImageRequestBody;
pub use response::{CreateImageResponse, ImageData};
