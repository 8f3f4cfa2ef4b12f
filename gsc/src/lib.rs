pub mod build;
pub mod config;
pub mod constants;
pub mod context;
pub mod images;
pub mod metadata;
pub mod options;
pub mod render;
pub mod run;
pub mod substitutions;
pub mod template;
pub mod utils;
