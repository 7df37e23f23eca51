pub mod aggregate;
pub mod bootstrap;
pub mod config;
pub mod data;
pub mod inner;
pub mod kpi;
pub mod model;
pub mod outer;
pub mod reliability;
pub mod simulate;
