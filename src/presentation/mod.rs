//! Document templates for export artifacts.

pub mod views;
