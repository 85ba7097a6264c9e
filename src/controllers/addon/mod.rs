pub mod controller;
pub mod reconcilers;

pub use controller::run;
