pub mod backtest;
pub mod calibration;
pub mod config;
pub mod dataset;
pub mod ensemble;
pub mod error;
pub mod explain;
pub mod features;
pub mod history;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod report_export;
pub mod runtime;
pub mod service;
pub mod synthetic;
