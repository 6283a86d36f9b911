pub mod cache;
pub mod events;
pub mod grid;
pub mod loader;
pub mod range;
pub mod viewer;
pub mod wallhaven;

#[cfg(test)]
mod testing;
