pub mod asset;
pub mod clip;
pub mod timeline;
pub mod track;
pub mod transport;
