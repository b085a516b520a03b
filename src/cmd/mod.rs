pub mod info;
pub mod make;
