pub mod configs;
pub mod decorators;
pub mod health;
pub mod hooks;
pub mod permissions;
pub mod works;
