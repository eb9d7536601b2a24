pub mod dao;
pub mod models;
pub mod params;
