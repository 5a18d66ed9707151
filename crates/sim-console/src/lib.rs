pub mod api;
pub mod error;
pub mod form;
pub mod generation;
pub mod path_value;
pub mod poll;
pub mod run;
pub mod sanitize;
pub mod schema;
pub mod settings;
pub mod ui;
pub mod validation;

pub use error::{Error, Result};
