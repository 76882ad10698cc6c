pub mod settings;

pub use settings::{KeySpace, Settings};
