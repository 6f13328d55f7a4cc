pub mod group;
pub mod object;
pub mod observer;
pub mod registry;
pub mod session;
pub mod world;
