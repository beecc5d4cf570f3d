pub mod awards;
pub mod core;
pub mod points;
pub mod setup;
pub mod shop;
pub mod students;
