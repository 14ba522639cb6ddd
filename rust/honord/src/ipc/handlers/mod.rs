pub mod core;
pub mod demo;
pub mod grades;
pub mod honors;
pub mod reference;
pub mod setup;
pub mod students;
