pub mod controller;
pub mod manager;
pub mod target;
